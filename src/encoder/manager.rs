//! Encoder session manager.
//!
//! Owns per-slot [`SessionState`], feeds damage reports to the
//! [`EncoderCapability`] backend, and drains completions back into the
//! hub. Sequence numbers are assigned on the drain side so they are
//! gap-free and match delivery order regardless of how the backend
//! schedules its work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::hub::{Frame, Hub};
use crate::stats::ServerStats;

use super::capability::{
    Completion, CompletionSink, EncodeJob, EncodedAccessUnit, EncoderCapability, FramebufferHandle,
};
use super::fence::{fence_pair, ReleaseFence};
use super::session::SessionState;

/// Raised when a slot's encoder faults past the failure threshold.
///
/// The lease broker consumes these and tears the slot down as if the
/// workload had released it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFault {
    pub slot: u32,
    pub failures: u32,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Idle period after which the cached keyframe is re-emitted.
    /// Zero disables keepalive.
    pub keepalive_interval: Duration,
    /// Consecutive failures that fault the session.
    pub failure_threshold: u32,
    /// Backlog of encode completions awaiting the drain task.
    pub completion_queue_depth: usize,
}

impl EncoderConfig {
    pub fn new() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(2),
            failure_threshold: 3,
            completion_queue_depth: 64,
        }
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn completion_queue_depth(mut self, depth: usize) -> Self {
        self.completion_queue_depth = depth;
        self
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared encoder session manager.
///
/// `open`, `close`, and `on_damage` are synchronous so producers can call
/// them from their own threads without touching the runtime.
pub struct EncoderSessions {
    sessions: Mutex<HashMap<u32, SessionState>>,
    capability: Arc<dyn EncoderCapability>,
    completion_tx: mpsc::Sender<Completion>,
    faults_tx: mpsc::Sender<SlotFault>,
    keepalive_millis: AtomicU64,
    failure_threshold: u32,
    hub: Arc<Hub>,
    stats: Arc<ServerStats>,
}

impl EncoderSessions {
    /// Spawn the manager with its completion drain and keepalive tasks.
    ///
    /// The returned receiver yields a [`SlotFault`] whenever a session is
    /// torn down by the failure threshold.
    pub fn start(
        config: EncoderConfig,
        capability: Arc<dyn EncoderCapability>,
        hub: Arc<Hub>,
        stats: Arc<ServerStats>,
    ) -> (Arc<Self>, mpsc::Receiver<SlotFault>) {
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_queue_depth.max(1));
        let (faults_tx, faults_rx) = mpsc::channel(16);

        let manager = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            capability,
            completion_tx,
            faults_tx,
            keepalive_millis: AtomicU64::new(config.keepalive_interval.as_millis() as u64),
            failure_threshold: config.failure_threshold.max(1),
            hub,
            stats,
        });
        manager.spawn_completion_drain(completion_rx);
        manager.spawn_keepalive(config.keepalive_interval);
        (manager, faults_rx)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<u32, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_completion_drain(self: &Arc<Self>, mut rx: mpsc::Receiver<Completion>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(completion) = rx.recv().await {
                manager.handle_completion(completion).await;
            }
            debug!("Completion drain exiting");
        });
    }

    fn spawn_keepalive(self: &Arc<Self>, configured: Duration) {
        let manager = Arc::clone(self);
        // Tick granularity tracks the configured interval within bounds.
        let tick_period =
            (configured / 2).clamp(Duration::from_millis(50), Duration::from_millis(500));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_period);
            loop {
                ticker.tick().await;
                manager.keepalive_pass().await;
            }
        });
    }

    /// Open a session for a newly enabled slot.
    pub fn open(&self, slot: u32, generation: u64, width: u32, height: u32) {
        let mut sessions = self.lock_sessions();
        if let Some(old) = sessions.insert(slot, SessionState::new(slot, generation, width, height))
        {
            warn!(
                slot,
                old_generation = old.generation,
                generation,
                "Replacing live encoder session"
            );
        }
        info!(slot, generation, width, height, "Encoder session opened");
    }

    /// Close a slot's session. Completions still in flight for the old
    /// generation are dropped by the drain. Returns whether a session
    /// existed.
    pub fn close(&self, slot: u32) -> bool {
        match self.lock_sessions().remove(&slot) {
            Some(state) => {
                info!(
                    slot,
                    generation = state.generation,
                    frames = state.sequence(),
                    open_for = ?state.opened_at.elapsed(),
                    "Encoder session closed"
                );
                true
            }
            None => {
                debug!(slot, "Close for slot without session");
                false
            }
        }
    }

    pub fn has_session(&self, slot: u32) -> bool {
        self.lock_sessions().contains_key(&slot)
    }

    /// Report damage on a slot's framebuffer, stamped with the current
    /// time.
    pub fn on_damage(&self, slot: u32, framebuffer: FramebufferHandle) -> ReleaseFence {
        self.on_damage_at(slot, framebuffer, now_micros())
    }

    /// Report damage with an explicit timestamp, typically the flip time
    /// reported by the display hardware.
    ///
    /// Builds an encode job and hands it to the backend. Returns the
    /// fence the producer waits on before reusing the framebuffer; if the
    /// slot has no session the fence comes back already signaled.
    pub fn on_damage_at(
        &self,
        slot: u32,
        framebuffer: FramebufferHandle,
        timestamp_us: u64,
    ) -> ReleaseFence {
        let (signal, release) = fence_pair();
        let (generation, force_keyframe) = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(&slot) {
                Some(state) => {
                    if framebuffer.width != state.width || framebuffer.height != state.height {
                        warn!(
                            slot,
                            fb_width = framebuffer.width,
                            fb_height = framebuffer.height,
                            mode_width = state.width,
                            mode_height = state.height,
                            "Framebuffer dimensions do not match the session mode"
                        );
                    }
                    let force = state.force_keyframe;
                    state.force_keyframe = false;
                    (state.generation, force)
                }
                None => {
                    debug!(slot, "Damage for slot without session");
                    signal.completed();
                    return release;
                }
            }
        };

        let job = EncodeJob::new(
            slot,
            generation,
            timestamp_us,
            force_keyframe,
            framebuffer,
            signal,
            CompletionSink::new(self.completion_tx.clone()),
        );
        self.capability.encode(job);
        release
    }

    /// Make the slot's next encoded frame a keyframe.
    ///
    /// Called when a new subscriber attaches to a serving slot so it does
    /// not have to wait out the current delta run to start decoding.
    pub fn request_keyframe(&self, slot: u32) {
        let mut sessions = self.lock_sessions();
        match sessions.get_mut(&slot) {
            Some(state) => {
                state.force_keyframe = true;
                debug!(slot, "Keyframe requested");
            }
            None => debug!(slot, "Keyframe request for slot without session"),
        }
    }

    /// Adjust the keepalive interval at runtime. Zero disables it.
    pub fn set_keepalive_interval(&self, interval: Duration) {
        self.keepalive_millis
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        info!(interval_ms = interval.as_millis() as u64, "Keepalive interval updated");
    }

    async fn handle_completion(&self, completion: Completion) {
        match completion.result {
            Ok(unit) => self.handle_success(completion.slot, completion.generation, completion.timestamp_us, unit).await,
            Err(err) => self.handle_failure(completion.slot, completion.generation, &err),
        }
    }

    async fn handle_success(
        &self,
        slot: u32,
        generation: u64,
        timestamp_us: u64,
        unit: EncodedAccessUnit,
    ) {
        let frame = {
            let mut sessions = self.lock_sessions();
            let state = match sessions.get_mut(&slot) {
                Some(state) if state.generation == generation => state,
                _ => {
                    self.stats.record_frame_stale();
                    debug!(slot, generation, "Completion for closed or replaced session");
                    return;
                }
            };
            let sequence = state.next_sequence();
            state.record_success(unit.is_keyframe);
            Frame {
                slot,
                generation,
                sequence,
                is_keyframe: unit.is_keyframe,
                timestamp_us,
                payload: unit.payload,
            }
        };

        self.stats.record_frame_encoded();
        self.hub.push_frame(frame).await;
    }

    fn handle_failure(&self, slot: u32, generation: u64, err: &crate::error::EncoderError) {
        self.stats.record_encode_failure();

        let escalated = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(&slot) {
                Some(state) if state.generation == generation => {
                    let failures = state.record_failure();
                    if failures >= self.failure_threshold {
                        sessions.remove(&slot);
                        Some(failures)
                    } else {
                        warn!(slot, failures, error = %err, "Encode failed");
                        None
                    }
                }
                _ => {
                    debug!(slot, generation, "Failure from closed or replaced session");
                    None
                }
            }
        };

        if let Some(failures) = escalated {
            self.stats.record_slot_fault();
            error!(slot, failures, error = %err, "Encoder session faulted; requesting teardown");
            if self.faults_tx.try_send(SlotFault { slot, failures }).is_err() {
                warn!(slot, "Fault channel unavailable; fault dropped");
            }
        }
    }

    async fn keepalive_pass(&self) {
        let interval_ms = self.keepalive_millis.load(Ordering::Relaxed);
        if interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(interval_ms);
        let now = Instant::now();

        let idle: Vec<(u32, u64)> = {
            let mut sessions = self.lock_sessions();
            let mut idle = Vec::new();
            for state in sessions.values_mut() {
                if state.idle_for(now) < interval {
                    continue;
                }
                if state.last_keyframe_at.is_some() {
                    idle.push((state.slot, state.generation));
                } else {
                    // Nothing to re-emit yet; whenever damage does arrive
                    // it starts the stream with a keyframe.
                    state.force_keyframe = true;
                }
            }
            idle
        };

        for (slot, generation) in idle {
            let Some((serving_generation, keyframe)) = self.hub.cached_keyframe(slot).await else {
                continue;
            };
            if serving_generation != generation {
                continue;
            }
            // Rides the normal completion path so the re-emission gets the
            // next sequence number in order with real encodes.
            let completion = Completion {
                slot,
                generation,
                timestamp_us: now_micros(),
                result: Ok(EncodedAccessUnit {
                    payload: keyframe.payload,
                    is_keyframe: true,
                }),
            };
            if self.completion_tx.try_send(completion).is_ok() {
                debug!(slot, "Idle slot; re-emitting cached keyframe");
            }
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
