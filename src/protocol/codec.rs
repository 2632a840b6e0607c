//! Encoding and incremental decoding of protocol messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

use super::message::{opcode, ErrorCode, FrameMessage, Message};

/// Default upper bound for a FRAME payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bytes of a FRAME message before the payload: opcode + slot + sequence +
/// keyframe flag + timestamp + length.
const FRAME_HEADER_LEN: usize = 1 + 4 + 8 + 1 + 8 + 4;

/// Serialize `msg` onto `dst`.
pub fn encode(msg: &Message, dst: &mut BytesMut) {
    match msg {
        Message::EnableSlot { slot, width, height } => {
            dst.reserve(13);
            dst.put_u8(opcode::ENABLE_SLOT);
            dst.put_u32(*slot);
            dst.put_u32(*width);
            dst.put_u32(*height);
        }
        Message::EnableAck { slot } => {
            dst.reserve(5);
            dst.put_u8(opcode::ENABLE_ACK);
            dst.put_u32(*slot);
        }
        Message::EnableErr { slot, code } => {
            dst.reserve(9);
            dst.put_u8(opcode::ENABLE_ERR);
            dst.put_u32(*slot);
            dst.put_u32(*code as u32);
        }
        Message::DisableSlot { slot } => {
            dst.reserve(5);
            dst.put_u8(opcode::DISABLE_SLOT);
            dst.put_u32(*slot);
        }
        Message::Subscribe { slot } => {
            dst.reserve(5);
            dst.put_u8(opcode::SUBSCRIBE);
            dst.put_u32(*slot);
        }
        Message::SubscribeAck { slot } => {
            dst.reserve(5);
            dst.put_u8(opcode::SUBSCRIBE_ACK);
            dst.put_u32(*slot);
        }
        Message::Unsubscribe { slot } => {
            dst.reserve(5);
            dst.put_u8(opcode::UNSUBSCRIBE);
            dst.put_u32(*slot);
        }
        Message::Frame(frame) => {
            debug_assert!(frame.payload.len() <= u32::MAX as usize);
            dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
            dst.put_u8(opcode::FRAME);
            dst.put_u32(frame.slot);
            dst.put_u64(frame.sequence);
            dst.put_u8(u8::from(frame.is_keyframe));
            dst.put_u64(frame.timestamp_us);
            dst.put_u32(frame.payload.len() as u32);
            dst.put_slice(&frame.payload);
        }
        Message::Ping { token } => {
            dst.reserve(9);
            dst.put_u8(opcode::PING);
            dst.put_u64(*token);
        }
        Message::Pong { token } => {
            dst.reserve(9);
            dst.put_u8(opcode::PONG);
            dst.put_u64(*token);
        }
    }
}

/// Incremental decoder over a receive buffer.
///
/// `decode` consumes nothing until a whole message is available, so callers
/// can feed it reads of any size.
#[derive(Debug, Clone)]
pub struct Decoder {
    max_frame_len: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Try to decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A
    /// [`ProtocolError`] means the stream is unrecoverable and the
    /// connection should be closed.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }

        let op = src[0];
        let need = match op {
            opcode::ENABLE_SLOT => 13,
            opcode::ENABLE_ERR => 9,
            opcode::ENABLE_ACK
            | opcode::DISABLE_SLOT
            | opcode::SUBSCRIBE
            | opcode::SUBSCRIBE_ACK
            | opcode::UNSUBSCRIBE => 5,
            opcode::PING | opcode::PONG => 9,
            opcode::FRAME => {
                if src.len() < FRAME_HEADER_LEN {
                    return Ok(None);
                }
                // Length field sits at the end of the frame header.
                let len = u32::from_be_bytes([src[22], src[23], src[24], src[25]]) as usize;
                if len > self.max_frame_len {
                    return Err(ProtocolError::FrameTooLarge {
                        len,
                        max: self.max_frame_len,
                    });
                }
                FRAME_HEADER_LEN + len
            }
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };

        if src.len() < need {
            src.reserve(need - src.len());
            return Ok(None);
        }

        src.advance(1);
        let msg = match op {
            opcode::ENABLE_SLOT => Message::EnableSlot {
                slot: src.get_u32(),
                width: src.get_u32(),
                height: src.get_u32(),
            },
            opcode::ENABLE_ACK => Message::EnableAck { slot: src.get_u32() },
            opcode::ENABLE_ERR => Message::EnableErr {
                slot: src.get_u32(),
                code: ErrorCode::try_from(src.get_u32())?,
            },
            opcode::DISABLE_SLOT => Message::DisableSlot { slot: src.get_u32() },
            opcode::SUBSCRIBE => Message::Subscribe { slot: src.get_u32() },
            opcode::SUBSCRIBE_ACK => Message::SubscribeAck { slot: src.get_u32() },
            opcode::UNSUBSCRIBE => Message::Unsubscribe { slot: src.get_u32() },
            opcode::FRAME => {
                let slot = src.get_u32();
                let sequence = src.get_u64();
                let is_keyframe = src.get_u8() != 0;
                let timestamp_us = src.get_u64();
                let len = src.get_u32() as usize;
                let payload: Bytes = src.split_to(len).freeze();
                Message::Frame(FrameMessage {
                    slot,
                    sequence,
                    is_keyframe,
                    timestamp_us,
                    payload,
                })
            }
            opcode::PING => Message::Ping { token: src.get_u64() },
            opcode::PONG => Message::Pong { token: src.get_u64() },
            // Unknown opcodes were rejected above.
            _ => unreachable!(),
        };

        Ok(Some(msg))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &Decoder, src: &mut BytesMut) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(src).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_enable_slot_round_trip() {
        let msg = Message::EnableSlot {
            slot: 3,
            width: 1920,
            height: 1080,
        };

        let mut buf = BytesMut::new();
        encode(&msg, &mut buf);
        assert_eq!(buf.len(), 13);

        let decoder = Decoder::new();
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = Message::Frame(FrameMessage {
            slot: 1,
            sequence: 42,
            is_keyframe: true,
            timestamp_us: 1_700_000_000_000_000,
            payload: Bytes::from_static(b"access unit"),
        });

        let mut buf = BytesMut::new();
        encode(&msg, &mut buf);

        let decoder = Decoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_partial_input_consumes_nothing() {
        let msg = Message::EnableSlot {
            slot: 0,
            width: 1280,
            height: 720,
        };
        let mut full = BytesMut::new();
        encode(&msg, &mut full);

        let decoder = Decoder::new();
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the final byte yields the message.
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i < full.len() - 1 {
                assert!(result.is_none());
                assert_eq!(buf.len(), i + 1);
            } else {
                assert_eq!(result.unwrap(), msg);
            }
        }
    }

    #[test]
    fn test_frame_split_across_reads() {
        let msg = Message::Frame(FrameMessage {
            slot: 2,
            sequence: 7,
            is_keyframe: false,
            timestamp_us: 9,
            payload: Bytes::from(vec![0xab; 100]),
        });
        let mut full = BytesMut::new();
        encode(&msg, &mut full);

        let decoder = Decoder::new();
        let mut buf = BytesMut::new();

        // Header only.
        buf.extend_from_slice(&full[..30]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        // Rest of the payload.
        buf.extend_from_slice(&full[30..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut buf = BytesMut::new();
        encode(&Message::Subscribe { slot: 4 }, &mut buf);
        encode(&Message::Ping { token: 11 }, &mut buf);
        encode(&Message::Unsubscribe { slot: 4 }, &mut buf);

        let decoder = Decoder::new();
        let msgs = decode_all(&decoder, &mut buf);
        assert_eq!(
            msgs,
            vec![
                Message::Subscribe { slot: 4 },
                Message::Ping { token: 11 },
                Message::Unsubscribe { slot: 4 },
            ]
        );
    }

    #[test]
    fn test_unknown_opcode() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);

        let decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::UnknownOpcode(0x7f)
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let msg = Message::Frame(FrameMessage {
            slot: 0,
            sequence: 1,
            is_keyframe: false,
            timestamp_us: 0,
            payload: Bytes::from(vec![0u8; 64]),
        });
        let mut buf = BytesMut::new();
        encode(&msg, &mut buf);

        let decoder = Decoder::with_max_frame_len(32);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::FrameTooLarge { len: 64, max: 32 }
        );
    }

    #[test]
    fn test_enable_err_unknown_code() {
        let mut buf = BytesMut::new();
        buf.put_u8(opcode::ENABLE_ERR);
        buf.put_u32(1);
        buf.put_u32(250);

        let decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            ProtocolError::UnknownErrorCode(250)
        );
    }
}
