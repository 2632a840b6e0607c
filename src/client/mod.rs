//! Frame streaming client
//!
//! Client-side access to a scanout stream server:
//! - Subscribing to slots on the viewer endpoint
//! - Receiving sequenced frames with per-slot gap detection

pub mod config;
pub mod subscriber;

pub use config::ClientConfig;
pub use subscriber::{FrameSubscriber, SubscriberEvent};
