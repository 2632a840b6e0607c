//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address viewers connect to
    pub viewer_addr: SocketAddr,

    /// Address the control plane connects to. Defaults to loopback; the
    /// control protocol carries no authentication of its own.
    pub control_addr: SocketAddr,

    /// Per-subscriber outbound frame queue depth
    pub subscriber_queue_depth: usize,

    /// Largest frame payload accepted from or sent to a peer
    pub max_frame_len: usize,

    /// Maximum concurrent connections across both listeners (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    /// How long a closing connection may spend flushing its queue
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            viewer_addr: "0.0.0.0:7500".parse().unwrap(),
            control_addr: "127.0.0.1:7501".parse().unwrap(),
            subscriber_queue_depth: 32,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_connections: 0, // Unlimited
            tcp_nodelay: true,  // Important for low latency
            read_buffer_size: 64 * 1024, // 64KB
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Set the viewer bind address
    pub fn viewer_bind(mut self, addr: SocketAddr) -> Self {
        self.viewer_addr = addr;
        self
    }

    /// Set the control bind address
    pub fn control_bind(mut self, addr: SocketAddr) -> Self {
        self.control_addr = addr;
        self
    }

    /// Set the per-subscriber queue depth (minimum 1)
    pub fn subscriber_queue_depth(mut self, depth: usize) -> Self {
        self.subscriber_queue_depth = depth.max(1);
        self
    }

    /// Set the maximum frame payload length
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
