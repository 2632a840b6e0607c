//! Scanout slot leasing and multiplexed frame streaming for virtual
//! displays.
//!
//! A host exposes a fixed pool of virtual scanout slots. A workload
//! leases one, renders into its framebuffer, and reports damage; each
//! damage event is encoded once and fanned out to every viewer
//! subscribed to that slot over a framed TCP protocol.
//!
//! ```text
//!              lease / release              enable / disable
//!  workload ─────────► LeaseBroker ─────────► ControlHandle
//!     │                     │                   │        │
//!     │ damage              │ slot state        ▼        ▼
//!     │                     ▼              EncoderSessions
//!     │                 SlotTable               │
//!     └─────────────────────────────────────────┘
//!                                               │ sequenced frames
//!                                               ▼
//!                            viewers ◄─── StreamServer ◄─── Hub
//! ```
//!
//! The pieces compose around three seams:
//! - [`EncoderCapability`] abstracts the hardware encoder.
//! - [`CapabilityIssuer`] abstracts how lease capabilities are minted.
//! - [`ControlHandle`] is the one path that enables and disables slots,
//!   so serving state and encoder sessions never disagree about order.
//!
//! # Quick start
//! ```no_run
//! use std::sync::Arc;
//! use scanout_rs::{
//!     BrokerConfig, ControlHandle, CopyEncoder, EncoderConfig, EncoderSessions, Hub,
//!     LeaseBroker, LocalCapabilityIssuer, ServerConfig, ServerStats, SlotTable,
//!     StreamServer, DEFAULT_POOL_SIZE,
//! };
//!
//! # async fn example() -> scanout_rs::Result<()> {
//! let stats = Arc::new(ServerStats::new());
//! let pool = Arc::new(SlotTable::new(DEFAULT_POOL_SIZE));
//! let config = ServerConfig::default();
//! let hub = Arc::new(Hub::new(
//!     pool.len(),
//!     config.subscriber_queue_depth,
//!     Arc::clone(&stats),
//! ));
//!
//! let (sessions, faults) = EncoderSessions::start(
//!     EncoderConfig::new(),
//!     Arc::new(CopyEncoder::new()),
//!     Arc::clone(&hub),
//!     Arc::clone(&stats),
//! );
//! let control = ControlHandle::new(Arc::clone(&hub), Arc::clone(&sessions));
//! let broker = LeaseBroker::start(
//!     BrokerConfig::default(),
//!     Arc::clone(&pool),
//!     control.clone(),
//!     Arc::new(LocalCapabilityIssuer::new()),
//!     faults,
//!     Arc::clone(&stats),
//! );
//!
//! let lease = broker.request_lease("workload-1").await?;
//! println!("leased slot {}", lease.slot_index);
//!
//! let server = StreamServer::new(config, hub, control, stats);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod encoder;
pub mod error;
pub mod hub;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stats;

pub use broker::{
    BrokerConfig, CapabilityDescriptor, CapabilityIssuer, Lease, LeaseBroker, LeaseInfo,
    LocalCapabilityIssuer, WorkloadId,
};
pub use client::{ClientConfig, FrameSubscriber, SubscriberEvent};
pub use encoder::{
    CopyEncoder, EncodeJob, EncodedAccessUnit, EncoderCapability, EncoderConfig, EncoderSessions,
    FramebufferHandle, ReleaseFence, SlotFault,
};
pub use error::{Error, Result};
pub use hub::{Frame, Hub, SubscribeOutcome};
pub use pool::{ScanoutSlot, SlotState, SlotTable, DEFAULT_POOL_SIZE};
pub use protocol::{Message, DEFAULT_MAX_FRAME_LEN};
pub use server::{ControlHandle, ReinitOutcome, ServerConfig, ServerHandle, StreamServer};
pub use stats::{ServerStats, StatsSnapshot};
