//! Protocol message types.

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;

/// Message opcodes.
pub mod opcode {
    pub const ENABLE_SLOT: u8 = 0x01;
    pub const ENABLE_ACK: u8 = 0x02;
    pub const ENABLE_ERR: u8 = 0x03;
    pub const DISABLE_SLOT: u8 = 0x04;
    pub const SUBSCRIBE: u8 = 0x05;
    pub const SUBSCRIBE_ACK: u8 = 0x06;
    pub const UNSUBSCRIBE: u8 = 0x07;
    pub const FRAME: u8 = 0x08;
    pub const PING: u8 = 0x09;
    pub const PONG: u8 = 0x0a;
}

/// Error codes carried by ENABLE_ERR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Slot index outside the server's pool
    InvalidSlot = 1,
    /// Encoder session could not be opened
    EncoderUnavailable = 2,
    /// Anything else; details are in the server log
    Internal = 3,
}

impl TryFrom<u32> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::InvalidSlot),
            2 => Ok(ErrorCode::EncoderUnavailable),
            3 => Ok(ErrorCode::Internal),
            other => Err(ProtocolError::UnknownErrorCode(other)),
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Broker -> server: start scanning out `slot` at the given mode
    EnableSlot { slot: u32, width: u32, height: u32 },
    /// Server -> broker: slot is serving
    EnableAck { slot: u32 },
    /// Server -> broker: enable failed
    EnableErr { slot: u32, code: ErrorCode },
    /// Broker -> server: stop scanning out `slot`
    DisableSlot { slot: u32 },
    /// Client -> server: add me to the slot's subscriber set
    Subscribe { slot: u32 },
    /// Server -> client: subscription recorded
    SubscribeAck { slot: u32 },
    /// Client -> server: remove me from the slot's subscriber set
    Unsubscribe { slot: u32 },
    /// Server -> client: one encoded access unit
    Frame(FrameMessage),
    /// Liveness probe, either direction
    Ping { token: u64 },
    /// Liveness reply, either direction
    Pong { token: u64 },
}

impl Message {
    pub fn opcode(&self) -> u8 {
        match self {
            Message::EnableSlot { .. } => opcode::ENABLE_SLOT,
            Message::EnableAck { .. } => opcode::ENABLE_ACK,
            Message::EnableErr { .. } => opcode::ENABLE_ERR,
            Message::DisableSlot { .. } => opcode::DISABLE_SLOT,
            Message::Subscribe { .. } => opcode::SUBSCRIBE,
            Message::SubscribeAck { .. } => opcode::SUBSCRIBE_ACK,
            Message::Unsubscribe { .. } => opcode::UNSUBSCRIBE,
            Message::Frame(_) => opcode::FRAME,
            Message::Ping { .. } => opcode::PING,
            Message::Pong { .. } => opcode::PONG,
        }
    }
}

/// Wire form of one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    pub slot: u32,
    pub sequence: u64,
    pub is_keyframe: bool,
    /// Producer timestamp in microseconds
    pub timestamp_us: u64,
    /// Encoded access unit; cheap to clone
    pub payload: Bytes,
}

/// Role of a connection, fixed at accept time by which listener accepted it.
///
/// Control connections drive slot lifecycle; viewer connections subscribe to
/// frames. Neither may send the other's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Control,
    Viewer,
}

impl ConnectionRole {
    /// Whether a peer with this role may send `op` to the server.
    pub fn permits(self, op: u8) -> bool {
        match self {
            ConnectionRole::Control => matches!(
                op,
                opcode::ENABLE_SLOT | opcode::DISABLE_SLOT | opcode::PING | opcode::PONG
            ),
            ConnectionRole::Viewer => matches!(
                op,
                opcode::SUBSCRIBE | opcode::UNSUBSCRIBE | opcode::PING | opcode::PONG
            ),
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Control => f.write_str("control"),
            ConnectionRole::Viewer => f.write_str("viewer"),
        }
    }
}
