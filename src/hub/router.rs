//! The hub proper: slot table, connection registry, fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, ProtocolError};
use crate::stats::ServerStats;

use super::entry::{ServingState, SlotEntry};
use super::frame::{CachedKeyframe, Frame};
use super::subscriber::{ConnectionId, OutboundQueue, PushOutcome};

struct SubscriberHandle {
    queue: Arc<OutboundQueue>,
    peer: String,
}

/// Result of a subscribe call.
#[derive(Debug)]
pub struct SubscribeOutcome {
    /// False when the connection was already subscribed to the slot.
    pub newly_added: bool,
    /// Cached keyframe to send to a subscriber that joined a serving
    /// slot, so it can render before the next damage.
    pub catch_up: Option<Frame>,
}

/// Routes frames from encoder sessions to subscriber queues and tracks
/// which slots are currently serving.
///
/// All methods take `&self`; the hub is shared as `Arc<Hub>` between the
/// server, the encoder manager, and the lease broker.
pub struct Hub {
    slot_count: usize,
    slots: RwLock<Vec<SlotEntry>>,
    connections: RwLock<HashMap<ConnectionId, SubscriberHandle>>,
    queue_depth: AtomicUsize,
    stats: Arc<ServerStats>,
}

impl Hub {
    pub fn new(slot_count: usize, queue_depth: usize, stats: Arc<ServerStats>) -> Self {
        let mut slots = Vec::with_capacity(slot_count);
        slots.resize_with(slot_count, SlotEntry::new);
        Self {
            slot_count,
            slots: RwLock::new(slots),
            connections: RwLock::new(HashMap::new()),
            queue_depth: AtomicUsize::new(queue_depth.max(1)),
            stats,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Queue depth applied to connections registered from now on.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn set_queue_depth(&self, depth: usize) {
        let depth = depth.max(1);
        self.queue_depth.store(depth, Ordering::Relaxed);
        info!(depth, "Subscriber queue depth updated");
    }

    fn check_slot(&self, slot: u32) -> Result<usize, Error> {
        let idx = slot as usize;
        if idx >= self.slot_count {
            return Err(ProtocolError::SlotOutOfRange {
                slot,
                limit: self.slot_count as u32,
            }
            .into());
        }
        Ok(idx)
    }

    /// Register a connection and hand back its outbound queue.
    pub async fn register_connection(
        &self,
        id: ConnectionId,
        peer: impl Into<String>,
    ) -> Arc<OutboundQueue> {
        let queue = Arc::new(OutboundQueue::new(self.queue_depth()));
        let handle = SubscriberHandle {
            queue: Arc::clone(&queue),
            peer: peer.into(),
        };
        self.connections.write().await.insert(id, handle);
        self.stats.record_connection_opened();
        queue
    }

    /// Tear down a connection: drop its subscriptions everywhere, close its
    /// queue, forget it.
    pub async fn connection_closed(&self, id: ConnectionId) {
        let mut removed_subs = 0u64;
        {
            let mut slots = self.slots.write().await;
            for entry in slots.iter_mut() {
                if entry.subscribers.remove(&id) {
                    removed_subs += 1;
                }
            }
        }
        if removed_subs > 0 {
            self.stats.record_subscription_removed(removed_subs);
        }

        if let Some(handle) = self.connections.write().await.remove(&id) {
            handle.queue.close();
            self.stats.record_connection_closed();
            debug!(conn = %id, peer = %handle.peer, subscriptions = removed_subs, "Connection removed from hub");
        }
    }

    /// Add `id` to the slot's subscriber set.
    ///
    /// Subscribing to a dark slot is valid; frames start flowing when a
    /// workload enables it. When the slot is already serving and a
    /// keyframe has been cached, the outcome carries it as catch-up for
    /// the new subscriber. Repeat subscriptions are no-ops and never
    /// replay the catch-up.
    pub async fn subscribe(&self, id: ConnectionId, slot: u32) -> Result<SubscribeOutcome, Error> {
        let idx = self.check_slot(slot)?;
        let mut slots = self.slots.write().await;
        let entry = &mut slots[idx];

        if !entry.subscribers.insert(id) {
            return Ok(SubscribeOutcome {
                newly_added: false,
                catch_up: None,
            });
        }
        self.stats.record_subscription_added();
        debug!(conn = %id, slot, "Subscribed");

        let catch_up = entry.serving.as_ref().and_then(|serving| {
            serving.cached_keyframe.as_ref().map(|kf| Frame {
                slot,
                generation: serving.generation,
                sequence: kf.sequence,
                is_keyframe: true,
                timestamp_us: kf.timestamp_us,
                payload: kf.payload.clone(),
            })
        });
        Ok(SubscribeOutcome {
            newly_added: true,
            catch_up,
        })
    }

    /// Remove `id` from the slot's subscriber set. Idempotent.
    pub async fn unsubscribe(&self, id: ConnectionId, slot: u32) -> Result<(), Error> {
        let idx = self.check_slot(slot)?;
        let mut slots = self.slots.write().await;
        if slots[idx].subscribers.remove(&id) {
            self.stats.record_subscription_removed(1);
            debug!(conn = %id, slot, "Unsubscribed");
        }
        Ok(())
    }

    /// Mark a slot as serving under `generation`.
    ///
    /// The existing subscriber set is kept: viewers watching the slot
    /// across workloads reattach to the new stream automatically.
    pub async fn enable_slot(
        &self,
        slot: u32,
        generation: u64,
        width: u32,
        height: u32,
    ) -> Result<(), Error> {
        let idx = self.check_slot(slot)?;
        let mut slots = self.slots.write().await;
        let entry = &mut slots[idx];
        if let Some(old) = &entry.serving {
            warn!(
                slot,
                old_generation = old.generation,
                new_generation = generation,
                "Slot re-enabled while already serving"
            );
        }
        entry.serving = Some(ServingState::new(generation, width, height));
        self.stats.record_slot_enabled();
        info!(slot, generation, width, height, "Slot serving");
        Ok(())
    }

    /// Stop serving a slot and purge its queued frames from every
    /// connection. Returns whether the slot had been serving.
    pub async fn disable_slot(&self, slot: u32) -> Result<bool, Error> {
        let idx = self.check_slot(slot)?;
        let taken = {
            let mut slots = self.slots.write().await;
            slots[idx].serving.take()
        };
        let Some(serving) = taken else {
            return Ok(false);
        };

        // Frames already fanned out but not yet written must not reach
        // viewers after the disable completes.
        let mut purged = 0u64;
        {
            let connections = self.connections.read().await;
            for handle in connections.values() {
                purged += handle.queue.purge_slot(slot) as u64;
            }
        }
        if purged > 0 {
            self.stats.record_frames_dropped(purged);
        }
        self.stats.record_slot_disabled();
        info!(
            slot,
            purged,
            served = ?serving.enabled_at.elapsed(),
            "Slot dark"
        );
        Ok(true)
    }

    /// Generation of the serving state, if the slot is serving.
    pub async fn serving_generation(&self, slot: u32) -> Option<u64> {
        let slots = self.slots.read().await;
        slots
            .get(slot as usize)
            .and_then(|e| e.serving.as_ref())
            .map(|s| s.generation)
    }

    /// Mode the slot was enabled with, if it is serving.
    pub async fn serving_mode(&self, slot: u32) -> Option<(u32, u32)> {
        let slots = self.slots.read().await;
        slots
            .get(slot as usize)
            .and_then(|e| e.serving.as_ref())
            .map(|s| (s.width, s.height))
    }

    /// Cached keyframe of a serving slot, with its generation.
    pub(crate) async fn cached_keyframe(&self, slot: u32) -> Option<(u64, CachedKeyframe)> {
        let slots = self.slots.read().await;
        let serving = slots.get(slot as usize)?.serving.as_ref()?;
        let kf = serving.cached_keyframe.clone()?;
        Some((serving.generation, kf))
    }

    pub async fn subscriber_count(&self, slot: u32) -> usize {
        let slots = self.slots.read().await;
        slots
            .get(slot as usize)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Fan a frame out to the slot's subscribers.
    ///
    /// Frames whose generation does not match the serving state are late
    /// output of a torn-down session and are discarded here. Returns the
    /// number of subscriber queues the frame reached.
    pub async fn push_frame(&self, frame: Frame) -> usize {
        let targets: Vec<ConnectionId> = {
            let mut slots = self.slots.write().await;
            let entry = match slots.get_mut(frame.slot as usize) {
                Some(entry) => entry,
                None => return 0,
            };
            let serving = match &mut entry.serving {
                Some(serving) if serving.generation == frame.generation => serving,
                _ => {
                    self.stats.record_frame_stale();
                    debug!(
                        slot = frame.slot,
                        generation = frame.generation,
                        sequence = frame.sequence,
                        "Dropping frame from stale generation"
                    );
                    return 0;
                }
            };
            if frame.is_keyframe {
                serving.cached_keyframe = Some(CachedKeyframe {
                    sequence: frame.sequence,
                    timestamp_us: frame.timestamp_us,
                    payload: frame.payload.clone(),
                });
            }
            entry.subscribers.iter().copied().collect()
        };

        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0usize;
        let mut dropped = 0u64;
        {
            let connections = self.connections.read().await;
            for id in targets {
                let Some(handle) = connections.get(&id) else {
                    continue;
                };
                match handle.queue.push_frame(frame.clone()) {
                    PushOutcome::Queued => delivered += 1,
                    PushOutcome::DroppedOldest => {
                        delivered += 1;
                        dropped += 1;
                    }
                    PushOutcome::DroppedIncoming => dropped += 1,
                    PushOutcome::Closed => {}
                }
            }
        }
        if delivered > 0 {
            self.stats.record_frames_delivered(delivered as u64);
        }
        if dropped > 0 {
            self.stats.record_frames_dropped(dropped);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::OutboundItem;
    use bytes::Bytes;

    fn hub(slot_count: usize) -> Hub {
        Hub::new(slot_count, 8, Arc::new(ServerStats::new()))
    }

    fn frame(slot: u32, generation: u64, sequence: u64, is_keyframe: bool) -> Frame {
        Frame {
            slot,
            generation,
            sequence,
            is_keyframe,
            timestamp_us: sequence * 16_000,
            payload: Bytes::from(vec![0u8; 32]),
        }
    }

    async fn queued_sequences(queue: &OutboundQueue) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        queue.close();
        while let Some(item) = queue.pop().await {
            if let OutboundItem::Frame(f) = item {
                out.push((f.slot, f.sequence));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_subscribe_before_enable_then_stream() {
        let hub = hub(4);
        let conn = ConnectionId(1);
        let queue = hub.register_connection(conn, "test").await;

        // Dark slot: subscription is accepted, nothing is delivered.
        let outcome = hub.subscribe(conn, 0).await.unwrap();
        assert!(outcome.newly_added);
        assert!(outcome.catch_up.is_none());
        assert_eq!(hub.push_frame(frame(0, 1, 1, true)).await, 0);

        hub.enable_slot(0, 1, 640, 480).await.unwrap();
        assert_eq!(hub.push_frame(frame(0, 1, 1, true)).await, 1);
        assert_eq!(hub.push_frame(frame(0, 1, 2, false)).await, 1);
        assert_eq!(hub.push_frame(frame(0, 1, 3, false)).await, 1);

        let got = queued_sequences(&queue).await;
        assert_eq!(got, vec![(0, 1), (0, 2), (0, 3)]);
    }

    #[tokio::test]
    async fn test_catch_up_keyframe_on_subscribe() {
        let hub = hub(4);
        hub.enable_slot(2, 7, 640, 480).await.unwrap();

        let early = ConnectionId(1);
        hub.register_connection(early, "early").await;
        hub.subscribe(early, 2).await.unwrap();

        hub.push_frame(frame(2, 7, 1, true)).await;
        hub.push_frame(frame(2, 7, 2, false)).await;

        let late = ConnectionId(2);
        hub.register_connection(late, "late").await;
        let caught = hub.subscribe(late, 2).await.unwrap().catch_up.unwrap();

        assert!(caught.is_keyframe);
        assert_eq!(caught.sequence, 1);
        assert_eq!(caught.generation, 7);
        assert_eq!(hub.serving_mode(2).await, Some((640, 480)));
    }

    #[tokio::test]
    async fn test_repeat_subscribe_is_noop() {
        let hub = hub(4);
        hub.enable_slot(0, 1, 640, 480).await.unwrap();
        hub.push_frame(frame(0, 1, 1, true)).await;

        let conn = ConnectionId(1);
        hub.register_connection(conn, "test").await;
        let first = hub.subscribe(conn, 0).await.unwrap();
        assert!(first.newly_added);
        assert!(first.catch_up.is_some());

        // Second subscribe: no duplicate catch-up, set unchanged.
        let repeat = hub.subscribe(conn, 0).await.unwrap();
        assert!(!repeat.newly_added);
        assert!(repeat.catch_up.is_none());
        assert_eq!(hub.subscriber_count(0).await, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_dropped() {
        let hub = hub(4);
        let conn = ConnectionId(1);
        let queue = hub.register_connection(conn, "test").await;
        hub.subscribe(conn, 0).await.unwrap();
        hub.enable_slot(0, 2, 640, 480).await.unwrap();

        assert_eq!(hub.push_frame(frame(0, 1, 9, true)).await, 0);
        assert_eq!(hub.push_frame(frame(0, 2, 1, true)).await, 1);

        let got = queued_sequences(&queue).await;
        assert_eq!(got, vec![(0, 1)]);
    }

    #[tokio::test]
    async fn test_reenable_fences_old_generation() {
        let hub = hub(4);
        let conn = ConnectionId(1);
        let queue = hub.register_connection(conn, "test").await;
        hub.subscribe(conn, 0).await.unwrap();

        hub.enable_slot(0, 1, 640, 480).await.unwrap();
        hub.enable_slot(0, 2, 640, 480).await.unwrap();
        assert_eq!(hub.serving_generation(0).await, Some(2));

        assert_eq!(hub.push_frame(frame(0, 1, 5, false)).await, 0);
        assert!(queued_sequences(&queue).await.is_empty());
    }

    #[tokio::test]
    async fn test_disable_purges_queued_frames() {
        let hub = hub(4);
        let conn = ConnectionId(1);
        let queue = hub.register_connection(conn, "test").await;
        hub.subscribe(conn, 0).await.unwrap();
        hub.subscribe(conn, 1).await.unwrap();

        hub.enable_slot(0, 1, 640, 480).await.unwrap();
        hub.enable_slot(1, 2, 640, 480).await.unwrap();
        hub.push_frame(frame(0, 1, 1, true)).await;
        hub.push_frame(frame(1, 2, 1, true)).await;
        hub.push_frame(frame(0, 1, 2, false)).await;

        assert!(hub.disable_slot(0).await.unwrap());

        // Only the other slot's frame survives in the queue.
        let got = queued_sequences(&queue).await;
        assert_eq!(got, vec![(1, 1)]);
        // The set itself is kept for the next workload.
        assert_eq!(hub.subscriber_count(0).await, 1);
    }

    #[tokio::test]
    async fn test_disable_dark_slot_is_noop() {
        let hub = hub(4);
        assert!(!hub.disable_slot(3).await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_closed_cleans_up() {
        let hub = hub(4);
        let conn = ConnectionId(1);
        let queue = hub.register_connection(conn, "test").await;
        hub.subscribe(conn, 0).await.unwrap();
        hub.subscribe(conn, 1).await.unwrap();

        hub.connection_closed(conn).await;
        assert_eq!(hub.subscriber_count(0).await, 0);
        assert_eq!(hub.subscriber_count(1).await, 0);
        assert!(queue.is_closed());

        // Frames no longer reach the dead connection.
        hub.enable_slot(0, 1, 640, 480).await.unwrap();
        assert_eq!(hub.push_frame(frame(0, 1, 1, true)).await, 0);
    }

    #[tokio::test]
    async fn test_slot_out_of_range() {
        let hub = hub(4);
        let conn = ConnectionId(1);
        hub.register_connection(conn, "test").await;
        assert!(hub.subscribe(conn, 4).await.is_err());
        assert!(hub.enable_slot(9, 1, 640, 480).await.is_err());
    }
}
