//! TCP streaming server.
//!
//! Two listeners, one hub. Viewers subscribe to slots and receive frames;
//! the control plane enables and disables slot streaming. See
//! [`listener::StreamServer`] for the accept loops and
//! [`control::ControlHandle`] for the enable/disable orchestration shared
//! with the lease broker.

pub mod config;
mod connection;
pub mod control;
pub mod listener;

pub use config::ServerConfig;
pub use control::ControlHandle;
pub use listener::{ReinitOutcome, ServerHandle, StreamServer};
