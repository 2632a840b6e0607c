//! Slot enable/disable orchestration.
//!
//! Enabling a slot touches two components in a fixed order: the hub first,
//! so the serving state is in place before the encoder session can produce
//! its first completion, then the encoder manager. Disable runs the same
//! pair in reverse so production stops before the hub purges what was
//! already queued. [`ControlHandle`] is the one place that ordering lives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::encoder::EncoderSessions;
use crate::error::Error;
use crate::hub::Hub;

/// Shared handle for enabling and disabling slot streaming.
///
/// Cloned by the wire control plane and the lease broker; both funnel
/// through the same orchestration.
#[derive(Clone)]
pub struct ControlHandle {
    hub: Arc<Hub>,
    sessions: Arc<EncoderSessions>,
    next_generation: Arc<AtomicU64>,
}

impl ControlHandle {
    pub fn new(hub: Arc<Hub>, sessions: Arc<EncoderSessions>) -> Self {
        Self {
            hub,
            sessions,
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Begin serving a slot. Returns the generation minted for this
    /// enable cycle.
    pub async fn enable_slot(&self, slot: u32, width: u32, height: u32) -> Result<u64, Error> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        if self.sessions.has_session(slot) {
            warn!(slot, "Enable found a live encoder session; closing it first");
            self.sessions.close(slot);
        }

        self.hub.enable_slot(slot, generation, width, height).await?;
        self.sessions.open(slot, generation, width, height);
        debug!(slot, generation, "Slot enable orchestrated");
        Ok(generation)
    }

    /// Stop serving a slot.
    ///
    /// When this returns, the encoder session is gone, queued frames for
    /// the slot have been purged, and any completion still in flight will
    /// be dropped as stale. Disabling a dark slot is a no-op; returns
    /// whether the slot had been serving.
    pub async fn disable_slot(&self, slot: u32) -> Result<bool, Error> {
        let had_session = self.sessions.close(slot);
        let was_serving = self.hub.disable_slot(slot).await?;
        debug!(slot, had_session, was_serving, "Slot disable orchestrated");
        Ok(was_serving)
    }

    /// Ask the slot's encoder session to make its next frame a keyframe.
    /// No-op for a dark slot.
    pub fn request_keyframe(&self, slot: u32) {
        self.sessions.request_keyframe(slot);
    }

    /// Adjust the encoder keepalive interval at runtime.
    pub fn set_keepalive_interval(&self, interval: Duration) {
        self.sessions.set_keepalive_interval(interval);
    }
}
