//! Wire protocol: message types and the framed codec.
//!
//! All integers are big-endian. Every message starts with a one-byte opcode
//! followed by fixed fields; only FRAME carries a variable payload, length
//! prefixed and bounded. Connections speak the protocol over a persistent
//! TCP stream in both directions.

pub mod codec;
pub mod message;

pub use codec::{Decoder, DEFAULT_MAX_FRAME_LEN};
pub use message::{ConnectionRole, ErrorCode, FrameMessage, Message};
