use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AnchorDims, BoardError, ClientId, IdeaId, Position, Priority, ProjectId, Result,
};

/// Maximum length of the card headline.
pub const MAX_CONTENT_LEN: usize = 2_000;

/// Maximum length of the optional detail text.
pub const MAX_DETAIL_LEN: usize = 20_000;

/// The shared mutable entity: one card on the matrix canvas.
///
/// Field layout mirrors the persisted row, so a store round-trip returns
/// a value that compares equal to what was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Idea {
    pub id: IdeaId,
    pub content: String,
    pub detail: Option<String>,
    pub priority: Priority,
    pub position: Position,
    pub collapsed: bool,
    /// Box size captured the last time `position` was deliberately set.
    /// Historical anchor, never updated on collapse toggles alone.
    pub anchor_dims: Option<AnchorDims>,
    pub locked_by: Option<ClientId>,
    pub locked_until: Option<DateTime<Utc>>,
    pub project_id: ProjectId,
    pub created_by: ClientId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Idea {
    /// Merge a partial update into this row. Unset patch fields leave the
    /// row untouched; `updated_at` is owned by the store and not bumped here.
    pub fn apply_patch(&mut self, patch: &IdeaPatch) {
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(detail) = &patch.detail {
            self.detail = detail.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(collapsed) = patch.collapsed {
            self.collapsed = collapsed;
        }
        if let Some(anchor) = patch.anchor_dims {
            self.anchor_dims = anchor;
        }
    }
}

/// Fields a client supplies when creating an idea. Identity, authorship
/// and timestamps are assigned elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeaDraft {
    pub content: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub position: Position,
    pub project_id: ProjectId,
}

impl IdeaDraft {
    pub fn new(project_id: ProjectId, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            detail: None,
            priority: Priority::default(),
            position: Position::default(),
            project_id,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(BoardError::EmptyContent);
        }
        if self.content.chars().count() > MAX_CONTENT_LEN {
            return Err(BoardError::ContentTooLong {
                max: MAX_CONTENT_LEN,
            });
        }
        if let Some(detail) = &self.detail {
            if detail.chars().count() > MAX_DETAIL_LEN {
                return Err(BoardError::DetailTooLong {
                    max: MAX_DETAIL_LEN,
                });
            }
        }
        if !self.position.is_finite() {
            return Err(BoardError::NonFiniteCoordinate);
        }
        Ok(())
    }
}

/// Partial update of an idea. `detail` and `anchor_dims` are doubly
/// optional: the outer `None` means "leave unchanged", `Some(None)` means
/// "clear the field".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdeaPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapsed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_dims: Option<Option<AnchorDims>>,
}

impl IdeaPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn collapsed(collapsed: bool) -> Self {
        Self {
            collapsed: Some(collapsed),
            ..Self::default()
        }
    }

    /// A position write: the new anchor and the box snapshot taken at the
    /// same moment always travel together.
    pub fn moved(position: Position, anchor: AnchorDims) -> Self {
        Self {
            position: Some(position),
            anchor_dims: Some(Some(anchor)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.detail.is_none()
            && self.priority.is_none()
            && self.position.is_none()
            && self.collapsed.is_none()
            && self.anchor_dims.is_none()
    }

    /// Overlay `later` onto this patch, later fields winning. Used when
    /// coalescing rapid edits against the same entity into one write.
    pub fn merge(&mut self, later: IdeaPatch) {
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.detail.is_some() {
            self.detail = later.detail;
        }
        if later.priority.is_some() {
            self.priority = later.priority;
        }
        if later.position.is_some() {
            self.position = later.position;
        }
        if later.collapsed.is_some() {
            self.collapsed = later.collapsed;
        }
        if later.anchor_dims.is_some() {
            self.anchor_dims = later.anchor_dims;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(BoardError::EmptyPatch);
        }
        if let Some(content) = &self.content {
            if content.trim().is_empty() {
                return Err(BoardError::EmptyContent);
            }
            if content.chars().count() > MAX_CONTENT_LEN {
                return Err(BoardError::ContentTooLong {
                    max: MAX_CONTENT_LEN,
                });
            }
        }
        if let Some(Some(detail)) = &self.detail {
            if detail.chars().count() > MAX_DETAIL_LEN {
                return Err(BoardError::DetailTooLong {
                    max: MAX_DETAIL_LEN,
                });
            }
        }
        if let Some(position) = &self.position {
            if !position.is_finite() {
                return Err(BoardError::NonFiniteCoordinate);
            }
        }
        Ok(())
    }
}
