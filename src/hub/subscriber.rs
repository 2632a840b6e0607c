//! Per-subscriber outbound queues.
//!
//! Each viewer connection owns one bounded [`OutboundQueue`]. The hub
//! pushes, the connection's writer task pops. Overflow drops the oldest
//! non-keyframe so a stalled viewer degrades to keyframes instead of
//! stalling the producer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::protocol::Message;

use super::frame::Frame;

/// Identifier for one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An item awaiting the connection's writer task.
///
/// Control replies (acks, pongs) ride the same queue as frames so ordering
/// toward one peer is total, but they are exempt from the frame capacity
/// and are never dropped.
#[derive(Debug, Clone)]
pub enum OutboundItem {
    Frame(Frame),
    Control(Message),
}

/// Result of a frame push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued without displacing anything
    Queued,
    /// Enqueued; the oldest droppable frame was discarded
    DroppedOldest,
    /// Queue held nothing droppable; the incoming frame was discarded
    DroppedIncoming,
    /// Queue is closed
    Closed,
}

struct Inner {
    items: VecDeque<OutboundItem>,
    frame_count: usize,
    dropped: u64,
    closed: bool,
}

/// Bounded frame queue with a keyframe-preserving overflow policy.
pub struct OutboundQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl OutboundQueue {
    /// `capacity` bounds queued frames; it is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                frame_count: 0,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State behind the mutex stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push one frame, applying the overflow policy when full:
    /// drop the oldest frame that is not the newest queued keyframe. An
    /// incoming keyframe supersedes any queued one, so for it every queued
    /// frame is droppable. If nothing is droppable the incoming frame is
    /// discarded instead. The caller is never blocked.
    pub fn push_frame(&self, frame: Frame) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        if inner.frame_count < self.capacity {
            inner.items.push_back(OutboundItem::Frame(frame));
            inner.frame_count += 1;
            drop(inner);
            self.notify.notify_one();
            return PushOutcome::Queued;
        }

        let newest_key = inner
            .items
            .iter()
            .rposition(|i| matches!(i, OutboundItem::Frame(f) if f.is_keyframe));

        let victim = if frame.is_keyframe {
            inner
                .items
                .iter()
                .position(|i| matches!(i, OutboundItem::Frame(_)))
        } else {
            inner.items.iter().enumerate().find_map(|(idx, item)| match item {
                OutboundItem::Frame(_) if Some(idx) != newest_key => Some(idx),
                _ => None,
            })
        };

        match victim {
            Some(idx) => {
                inner.items.remove(idx);
                inner.dropped += 1;
                inner.items.push_back(OutboundItem::Frame(frame));
                drop(inner);
                self.notify.notify_one();
                PushOutcome::DroppedOldest
            }
            None => {
                inner.dropped += 1;
                PushOutcome::DroppedIncoming
            }
        }
    }

    /// Push a control reply. Exempt from the frame capacity.
    ///
    /// Returns `false` when the queue is closed.
    pub fn push_control(&self, msg: Message) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.items.push_back(OutboundItem::Control(msg));
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Pop the next item, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<OutboundItem> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    if matches!(item, OutboundItem::Frame(_)) {
                        inner.frame_count -= 1;
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Remove every queued frame belonging to `slot`. Control items are
    /// untouched. Returns the number of frames removed.
    pub fn purge_slot(&self, slot: u32) -> usize {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner
            .items
            .retain(|i| !matches!(i, OutboundItem::Frame(f) if f.slot == slot));
        let removed = before - inner.items.len();
        inner.frame_count -= removed;
        removed
    }

    /// Close the queue. Pending items remain poppable; pushes become no-ops.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Frames dropped by the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    #[cfg(test)]
    pub(crate) fn frame_count(&self) -> usize {
        self.lock().frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(slot: u32, sequence: u64, is_keyframe: bool) -> Frame {
        Frame {
            slot,
            generation: 1,
            sequence,
            is_keyframe,
            timestamp_us: sequence * 1000,
            payload: Bytes::from(vec![0u8; 16]),
        }
    }

    fn popped_sequences(items: &[OutboundItem]) -> Vec<u64> {
        items
            .iter()
            .filter_map(|i| match i {
                OutboundItem::Frame(f) => Some(f.sequence),
                OutboundItem::Control(_) => None,
            })
            .collect()
    }

    async fn drain(queue: &OutboundQueue) -> Vec<OutboundItem> {
        let mut out = Vec::new();
        queue.close();
        while let Some(item) = queue.pop().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        queue.push_frame(frame(0, 1, true));
        queue.push_frame(frame(0, 2, false));
        queue.push_frame(frame(0, 3, false));

        let items = drain(&queue).await;
        assert_eq!(popped_sequences(&items), vec![1, 2, 3]);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_overflow_keeps_keyframe() {
        // Full queue: two non-keyframes and one keyframe.
        let queue = OutboundQueue::new(3);
        queue.push_frame(frame(0, 1, false));
        queue.push_frame(frame(0, 2, false));
        queue.push_frame(frame(0, 3, true));

        // Overflow with another delta frame.
        assert_eq!(queue.push_frame(frame(0, 4, false)), PushOutcome::DroppedOldest);

        let items = drain(&queue).await;
        assert_eq!(popped_sequences(&items), vec![2, 3, 4]);
        assert!(items.iter().any(|i| matches!(
            i,
            OutboundItem::Frame(f) if f.is_keyframe && f.sequence == 3
        )));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_incoming_keyframe_supersedes_queued_one() {
        let queue = OutboundQueue::new(2);
        queue.push_frame(frame(0, 1, true));
        queue.push_frame(frame(0, 2, false));

        assert_eq!(queue.push_frame(frame(0, 3, true)), PushOutcome::DroppedOldest);

        // The old keyframe went; the newer one is queued.
        let items = drain(&queue).await;
        assert_eq!(popped_sequences(&items), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_capacity_one_never_drops_latest_keyframe() {
        let queue = OutboundQueue::new(1);
        queue.push_frame(frame(0, 1, true));

        assert_eq!(queue.push_frame(frame(0, 2, false)), PushOutcome::DroppedIncoming);
        assert_eq!(queue.push_frame(frame(0, 3, false)), PushOutcome::DroppedIncoming);

        let items = drain(&queue).await;
        assert_eq!(popped_sequences(&items), vec![1]);
        assert_eq!(queue.dropped(), 2);
    }

    #[tokio::test]
    async fn test_control_items_exempt_from_capacity() {
        let queue = OutboundQueue::new(1);
        queue.push_frame(frame(0, 1, true));
        assert!(queue.push_control(Message::SubscribeAck { slot: 0 }));
        assert!(queue.push_control(Message::Pong { token: 7 }));

        let items = drain(&queue).await;
        assert_eq!(items.len(), 3);
        assert!(matches!(items[1], OutboundItem::Control(Message::SubscribeAck { slot: 0 })));
    }

    #[tokio::test]
    async fn test_purge_slot() {
        let queue = OutboundQueue::new(8);
        queue.push_frame(frame(0, 1, true));
        queue.push_frame(frame(5, 1, true));
        queue.push_frame(frame(0, 2, false));
        queue.push_control(Message::SubscribeAck { slot: 0 });

        assert_eq!(queue.purge_slot(0), 2);
        assert_eq!(queue.frame_count(), 1);

        let items = drain(&queue).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], OutboundItem::Frame(f) if f.slot == 5));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push_frame(frame(0, 1, true));
        queue.close();

        assert_eq!(queue.push_frame(frame(0, 2, false)), PushOutcome::Closed);
        assert!(!queue.push_control(Message::Pong { token: 1 }));

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        use std::sync::Arc;

        let queue = Arc::new(OutboundQueue::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        // Give the popper a chance to park first.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push_frame(frame(0, 1, false));

        let item = popper.await.unwrap();
        assert!(matches!(item, Some(OutboundItem::Frame(f)) if f.sequence == 1));
    }
}
