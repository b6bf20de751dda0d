/// Collaborative synchronization engine for the matrix canvas.
/// Keeps each client's local view of the shared idea collection converging
/// with the authoritative store while edits apply optimistically.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
pub use config::*;

mod store;
pub use store::*;

mod optimistic;
pub use optimistic::*;

mod lock;
pub use lock::*;

mod subscribe;
pub use subscribe::*;

mod engine;
pub use engine::*;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store rejected the write: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out before the store acknowledged it")]
    Timeout,

    #[error("entity is locked by {holder}")]
    LockDenied { holder: board::ClientId },

    #[error("idea not found: {0}")]
    NotFound(board::IdeaId),
}

impl From<board::BoardError> for SyncError {
    fn from(err: board::BoardError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Identity of one in-flight operation. Completion handlers and watchdogs
/// match on the ticket, never on "the latest op", so a slow completion that
/// was superseded resolves to a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpTicket(pub uuid::Uuid);

impl OpTicket {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OpTicket {
    fn default() -> Self {
        Self::new()
    }
}
