//! Hub-internal slot bookkeeping.

use std::collections::HashSet;
use std::time::Instant;

use super::frame::CachedKeyframe;
use super::subscriber::ConnectionId;

/// Streaming state carried by a slot while a workload is driving it.
///
/// The generation is minted when the slot is enabled and tags every frame
/// produced for it. Frames from an older generation that are still in
/// flight when the slot is re-enabled fail the comparison and are dropped.
pub(crate) struct ServingState {
    pub generation: u64,
    pub width: u32,
    pub height: u32,
    pub enabled_at: Instant,
    pub cached_keyframe: Option<CachedKeyframe>,
}

impl ServingState {
    pub(crate) fn new(generation: u64, width: u32, height: u32) -> Self {
        Self {
            generation,
            width,
            height,
            enabled_at: Instant::now(),
            cached_keyframe: None,
        }
    }
}

/// Per-slot fan-out entry.
///
/// The subscriber set outlives enable/disable cycles: a viewer that
/// subscribes while the slot is dark starts receiving frames as soon as a
/// workload lights it up.
pub(crate) struct SlotEntry {
    pub subscribers: HashSet<ConnectionId>,
    pub serving: Option<ServingState>,
}

impl SlotEntry {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: HashSet::new(),
            serving: None,
        }
    }
}
