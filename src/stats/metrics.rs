//! Counters shared by the hub, the encoder manager, and the lease broker.
//!
//! One `ServerStats` instance is threaded through the whole subsystem.
//! Counters are plain atomics; `snapshot` returns a coherent-enough copy
//! for logs and listings, not an exact cut.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared counter block.
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    frames_encoded: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    frames_stale: AtomicU64,
    encode_failures: AtomicU64,
    connections_accepted: AtomicU64,
    active_connections: AtomicU64,
    active_subscriptions: AtomicU64,
    slots_enabled: AtomicU64,
    slots_disabled: AtomicU64,
    leases_issued: AtomicU64,
    leases_released: AtomicU64,
    leases_reclaimed: AtomicU64,
    leases_expired: AtomicU64,
    slot_faults: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames_encoded: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_stale: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            active_subscriptions: AtomicU64::new(0),
            slots_enabled: AtomicU64::new(0),
            slots_disabled: AtomicU64::new(0),
            leases_issued: AtomicU64::new(0),
            leases_released: AtomicU64::new(0),
            leases_reclaimed: AtomicU64::new(0),
            leases_expired: AtomicU64::new(0),
            slot_faults: AtomicU64::new(0),
        }
    }

    pub fn record_frame_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// `count` subscribers had the frame enqueued.
    pub fn record_frames_delivered(&self, count: u64) {
        self.frames_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_frames_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_frame_stale(&self) {
        self.frames_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_subscription_added(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_removed(&self, count: u64) {
        self.active_subscriptions.fetch_sub(count, Ordering::Relaxed);
    }

    pub fn record_slot_enabled(&self) {
        self.slots_enabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slot_disabled(&self) {
        self.slots_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_issued(&self) {
        self.leases_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_released(&self) {
        self.leases_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_reclaimed(&self) {
        self.leases_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_expired(&self) {
        self.leases_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slot_fault(&self) {
        self.slot_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slots_disabled(&self) -> u64 {
        self.slots_disabled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.started_at.elapsed(),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_stale: self.frames_stale.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
            slots_enabled: self.slots_enabled.load(Ordering::Relaxed),
            slots_disabled: self.slots_disabled.load(Ordering::Relaxed),
            leases_issued: self.leases_issued.load(Ordering::Relaxed),
            leases_released: self.leases_released.load(Ordering::Relaxed),
            leases_reclaimed: self.leases_reclaimed.load(Ordering::Relaxed),
            leases_expired: self.leases_expired.load(Ordering::Relaxed),
            slot_faults: self.slot_faults.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub frames_encoded: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub frames_stale: u64,
    pub encode_failures: u64,
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub active_subscriptions: u64,
    pub slots_enabled: u64,
    pub slots_disabled: u64,
    pub leases_issued: u64,
    pub leases_released: u64,
    pub leases_reclaimed: u64,
    pub leases_expired: u64,
    pub slot_faults: u64,
}

impl StatsSnapshot {
    /// Average encoded frames per second since start.
    pub fn encode_rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.frames_encoded as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {}s, {} conns ({} active), {} subs, frames {} encoded / {} delivered / {} dropped, leases {} issued / {} released",
            self.uptime.as_secs(),
            self.connections_accepted,
            self.active_connections,
            self.active_subscriptions,
            self.frames_encoded,
            self.frames_delivered,
            self.frames_dropped,
            self.leases_issued,
            self.leases_released,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ServerStats::new();

        stats.record_frame_encoded();
        stats.record_frame_encoded();
        stats.record_frames_delivered(3);
        stats.record_frames_dropped(1);
        stats.record_connection_opened();
        stats.record_connection_opened();
        stats.record_connection_closed();
        stats.record_lease_issued();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_encoded, 2);
        assert_eq!(snap.frames_delivered, 3);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.leases_issued, 1);
    }

    #[test]
    fn test_subscription_gauge() {
        let stats = ServerStats::new();

        stats.record_subscription_added();
        stats.record_subscription_added();
        stats.record_subscription_added();
        stats.record_subscription_removed(2);

        assert_eq!(stats.snapshot().active_subscriptions, 1);
    }

    #[test]
    fn test_display_does_not_panic() {
        let stats = ServerStats::new();
        stats.record_frame_encoded();
        let line = stats.snapshot().to_string();
        assert!(line.contains("encoded"));
    }
}
