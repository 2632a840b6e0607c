//! Frame types flowing through the hub.

use bytes::Bytes;

use crate::protocol::FrameMessage;

/// One encoded access unit as produced by an encoder session.
///
/// Cheap to clone: the payload is reference-counted. `generation`
/// identifies the enable cycle that produced the frame and never leaves the
/// host process; it exists so output from a torn-down session can be
/// recognized and dropped instead of leaking into a successor lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub slot: u32,
    pub generation: u64,
    pub sequence: u64,
    pub is_keyframe: bool,
    pub timestamp_us: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Wire form of the frame. Strips the host-internal generation.
    pub fn to_message(&self) -> FrameMessage {
        FrameMessage {
            slot: self.slot,
            sequence: self.sequence,
            is_keyframe: self.is_keyframe,
            timestamp_us: self.timestamp_us,
            payload: self.payload.clone(),
        }
    }
}

/// Most recent keyframe of a serving slot.
///
/// Handed to late subscribers so they can render without waiting for the
/// next damage, and re-emitted by the keepalive when a slot goes idle.
#[derive(Debug, Clone)]
pub struct CachedKeyframe {
    pub sequence: u64,
    pub timestamp_us: u64,
    pub payload: Bytes,
}
