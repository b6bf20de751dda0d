use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

mod idea;
pub use idea::*;

mod geometry;
pub use geometry::*;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("content must not be empty")]
    EmptyContent,
    #[error("content exceeds {max} characters")]
    ContentTooLong { max: usize },
    #[error("detail exceeds {max} characters")]
    DetailTooLong { max: usize },
    #[error("coordinate is not a finite number")]
    NonFiniteCoordinate,
    #[error("box size must be positive, got {width}x{height}")]
    InvalidBoxSize { width: f64, height: f64 },
    #[error("patch does not change anything")]
    EmptyPatch,
}

pub type Result<T> = std::result::Result<T, BoardError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct IdeaId(pub Uuid);

impl IdeaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Client-minted id for an entity the store has not assigned yet.
    /// Lives in the same uuid space; replaced by the store id on insert.
    pub fn local() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IdeaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdeaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one connected client process. Doubles as the lock holder id
/// and as the author reference on created ideas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority category of an idea card.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

/// Logical position in the abstract canvas space. Interpreted as the
/// center of the rendered box, see the geometry module.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}
