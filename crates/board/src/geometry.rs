//! Dimension-aware coordinate math.
//!
//! A card's stored position is the center of its rendered box at the moment
//! it was last dragged. Collapsing or expanding the card changes the box
//! without touching the stored position, so rendering re-centers on a box
//! of a different size and the visible corner shifts. The functions here
//! compensate: the stored anchor plus the captured box size at write time
//! give a deterministic adjustment for whatever size the card renders at
//! now, and toggling back to the anchored size lands exactly on the stored
//! position again.

use serde::{Deserialize, Serialize};

use crate::{BoardError, Position, Result};

/// Rendered bounding box of a card, in canvas units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoxSize {
    pub width: f64,
    pub height: f64,
}

impl BoxSize {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.width.is_finite() && self.height.is_finite())
            || self.width <= 0.0
            || self.height <= 0.0
        {
            return Err(BoardError::InvalidBoxSize {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Default box for an expanded card that has never been dragged.
pub const FALLBACK_EXPANDED: BoxSize = BoxSize::new(260.0, 160.0);

/// Default box for a collapsed card that has never been dragged.
pub const FALLBACK_COLLAPSED: BoxSize = BoxSize::new(260.0, 56.0);

/// The `position_dimensions` record: box size and collapse state captured
/// when the position was last written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnchorDims {
    pub width: f64,
    pub height: f64,
    pub was_collapsed: bool,
}

impl AnchorDims {
    pub fn size(&self) -> BoxSize {
        BoxSize::new(self.width, self.height)
    }
}

/// Snapshot taken on a genuine position write (drag end). Collapse toggles
/// never call this.
pub fn capture_anchor(current: BoxSize, collapsed: bool) -> AnchorDims {
    AnchorDims {
        width: current.width,
        height: current.height,
        was_collapsed: collapsed,
    }
}

/// Box size the anchor is measured against. Rows that predate anchor
/// capture fall back to the static default for their collapse state, so
/// the delta is always computable.
pub fn anchored_box(anchor: Option<&AnchorDims>, collapsed: bool) -> BoxSize {
    match anchor {
        Some(dims) => dims.size(),
        None => fallback_box(collapsed),
    }
}

pub fn fallback_box(collapsed: bool) -> BoxSize {
    if collapsed {
        FALLBACK_COLLAPSED
    } else {
        FALLBACK_EXPANDED
    }
}

/// Size change between the box at anchor time and the box on screen now.
pub fn anchor_delta(
    anchor: Option<&AnchorDims>,
    current: BoxSize,
    collapsed: bool,
) -> (f64, f64) {
    let base = anchored_box(anchor, collapsed);
    (current.width - base.width, current.height - base.height)
}

/// Where to center the card so its perceived placement does not move when
/// the box size differs from the anchored size.
pub fn render_anchor(
    position: Position,
    anchor: Option<&AnchorDims>,
    current: BoxSize,
    collapsed: bool,
) -> Position {
    let (dw, dh) = anchor_delta(anchor, current, collapsed);
    Position::new(position.x + dw / 2.0, position.y + dh / 2.0)
}
