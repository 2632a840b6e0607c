//! Client configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Configuration for a [`FrameSubscriber`](super::FrameSubscriber).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Viewer endpoint of the stream server.
    pub server_addr: SocketAddr,

    /// How long [`subscribe`](super::FrameSubscriber::subscribe) waits
    /// for the server's acknowledgement.
    pub ack_timeout: Duration,

    /// Largest wire message the client will accept.
    pub max_frame_len: usize,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ack_timeout: Duration::from_secs(5),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("127.0.0.1:7500".parse().unwrap());
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }

    #[test]
    fn test_builder_chain() {
        let config = ClientConfig::new("127.0.0.1:7500".parse().unwrap())
            .ack_timeout(Duration::from_millis(100))
            .max_frame_len(1024);
        assert_eq!(config.ack_timeout, Duration::from_millis(100));
        assert_eq!(config.max_frame_len, 1024);
    }
}
