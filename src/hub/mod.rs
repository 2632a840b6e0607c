//! Frame hub: per-slot subscriber sets and fan-out.
//!
//! The hub is the junction between the encoder manager (which pushes frames),
//! the lease broker (which enables and disables serving), and viewer
//! connections (which subscribe and unsubscribe).
//!
//! # Architecture
//!
//! ```text
//!                              Arc<Hub>
//!                  ┌────────────────────────────────┐
//!                  │ slots: Vec<SlotEntry {         │
//!                  │   subscribers: HashSet<ConnId>,│
//!                  │   serving: Option<Serving {    │
//!                  │     generation,                │
//!                  │     cached_keyframe,           │
//!                  │   }>,                          │
//!                  │ }>                             │
//!                  │ connections: HashMap<ConnId,   │
//!                  │   SubscriberHandle { queue }>  │
//!                  └───────────────┬────────────────┘
//!                                  │
//!             ┌────────────────────┼────────────────────┐
//!             │                    │                    │
//!             ▼                    ▼                    ▼
//!        [Encoder mgr]       [Viewer conn]        [Viewer conn]
//!        push_frame()        queue.pop()          queue.pop()
//!             │                    │                    │
//!             └─► snapshot set ─► per-subscriber queue ─► TCP
//! ```
//!
//! # Fan-out
//!
//! `push_frame` snapshots the subscriber set, drops every hub lock, then
//! enqueues onto per-subscriber bounded queues. Frame payloads are
//! `bytes::Bytes`, so each enqueue is a reference-count bump, not a copy.
//! A slow subscriber only ever loses its own frames.

mod entry;

pub mod frame;
pub mod router;
pub mod subscriber;

pub use frame::{CachedKeyframe, Frame};
pub use router::{Hub, SubscribeOutcome};
pub use subscriber::{ConnectionId, OutboundItem, OutboundQueue, PushOutcome};
