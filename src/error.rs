//! Error types for the library.
//!
//! Errors are scoped: a [`PoolError`] or [`EncoderError`] concerns a single
//! slot, a [`ProtocolError`] concerns a single connection. Nothing in this
//! module represents a process-fatal condition.

use std::time::Duration;

use thiserror::Error;

use crate::broker::WorkloadId;
use crate::pool::SlotState;
use crate::protocol::ConnectionRole;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Slot pool error
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Wire protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Encoder session error
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    /// A workload asked for a second concurrent lease
    #[error("Workload {0} already holds a live lease")]
    AlreadyLeased(WorkloadId),

    /// A cross-component wait expired
    #[error("Timed out after {timeout:?} waiting for {operation} on slot {slot}")]
    Timeout {
        operation: &'static str,
        slot: u32,
        timeout: Duration,
    },

    /// The server accept loops are already running. Configuration changes
    /// for a live server go through [`ServerHandle::reinit`].
    ///
    /// [`ServerHandle::reinit`]: crate::server::ServerHandle::reinit
    #[error("Streaming server is already running; reconfigure through its handle")]
    ReinitRace,

    /// The lease broker task has shut down
    #[error("Lease broker is shut down")]
    BrokerClosed,

    /// Client operation attempted without a live connection
    #[error("Not connected")]
    NotConnected,

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the display output pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every slot is out of `Disabled`
    #[error("No free scanout slot available")]
    Exhausted,

    /// Requested state change is not an edge of the slot lifecycle
    #[error("Slot {slot}: invalid transition {from} -> {to}")]
    InvalidTransition {
        slot: u32,
        from: SlotState,
        to: SlotState,
    },

    /// Slot index outside the fixed table
    #[error("Slot {0} is out of range")]
    UnknownSlot(u32),
}

/// Errors raised by encoder sessions.
///
/// All of these are transient from the subsystem's point of view. Repeated
/// failures on one slot escalate to a forced disable of that slot, never to
/// a crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
    /// The capability failed to produce an access unit
    #[error("Failed to encode frame for slot {slot}: {reason}")]
    EncodeFailed { slot: u32, reason: String },

    /// Completion queue was full; the completion was dropped
    #[error("Encoder completion queue overflowed for slot {0}")]
    CompletionOverflow(u32),
}

/// Errors raised while decoding or validating wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// First byte of a message is not a known opcode
    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// ENABLE_ERR carried a code this build does not know
    #[error("Unknown error code {0}")]
    UnknownErrorCode(u32),

    /// FRAME length field exceeds the configured limit
    #[error("Frame payload of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Message is valid but not allowed for the connection's role
    #[error("Opcode {opcode:#04x} is not permitted on a {role} connection")]
    Forbidden {
        opcode: u8,
        role: ConnectionRole,
    },

    /// Slot index beyond the pool
    #[error("Slot {slot} is out of range (pool holds {limit} slots)")]
    SlotOutOfRange { slot: u32, limit: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::InvalidTransition {
            slot: 3,
            from: SlotState::Disabled,
            to: SlotState::Leased,
        };
        assert_eq!(
            err.to_string(),
            "Slot 3: invalid transition disabled -> leased"
        );

        let err = ProtocolError::UnknownOpcode(0xff);
        assert_eq!(err.to_string(), "Unknown opcode 0xff");
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = PoolError::Exhausted.into();
        assert!(matches!(err, Error::Pool(PoolError::Exhausted)));

        let err: Error = ProtocolError::UnknownOpcode(0x42).into();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnknownOpcode(0x42))
        ));
    }
}
