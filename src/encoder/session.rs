//! Per-slot encoder session state.

use std::time::{Duration, Instant};

/// Bookkeeping for one slot's live encode stream.
///
/// Sequence numbers are assigned here, by the manager's completion drain,
/// which is the only writer. That keeps the numbering gap-free and in
/// delivery order even when the backend completes jobs out of band.
pub(crate) struct SessionState {
    pub slot: u32,
    pub generation: u64,
    pub width: u32,
    pub height: u32,
    sequence: u64,
    pub force_keyframe: bool,
    pub consecutive_failures: u32,
    pub last_frame_at: Instant,
    pub last_keyframe_at: Option<Instant>,
    pub opened_at: Instant,
}

impl SessionState {
    pub fn new(slot: u32, generation: u64, width: u32, height: u32) -> Self {
        let now = Instant::now();
        Self {
            slot,
            generation,
            width,
            height,
            sequence: 0,
            // The first frame of a session must be independently decodable.
            force_keyframe: true,
            consecutive_failures: 0,
            last_frame_at: now,
            last_keyframe_at: None,
            opened_at: now,
        }
    }

    /// Sequence of the most recently numbered frame. 0 before any frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn record_success(&mut self, is_keyframe: bool) {
        self.consecutive_failures = 0;
        self.last_frame_at = Instant::now();
        if is_keyframe {
            self.last_keyframe_at = Some(self.last_frame_at);
        }
    }

    /// Returns the updated consecutive failure count. The next frame is
    /// forced to a keyframe because the viewer-side decoder state is no
    /// longer trustworthy.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.force_keyframe = true;
        self.consecutive_failures
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_frame_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_forces_keyframe() {
        let state = SessionState::new(0, 1, 640, 480);
        assert!(state.force_keyframe);
        assert_eq!(state.sequence(), 0);
    }

    #[test]
    fn test_sequence_is_gap_free() {
        let mut state = SessionState::new(0, 1, 640, 480);
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
        assert_eq!(state.next_sequence(), 3);
    }

    #[test]
    fn test_failure_rearms_keyframe_and_counts() {
        let mut state = SessionState::new(0, 1, 640, 480);
        state.force_keyframe = false;

        assert_eq!(state.record_failure(), 1);
        assert!(state.force_keyframe);
        assert_eq!(state.record_failure(), 2);

        state.record_success(true);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_keyframe_at.is_some());
    }
}
