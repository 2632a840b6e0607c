//! Pass-through encoder backend.

use super::capability::{EncodeJob, EncodedAccessUnit, EncoderCapability};

/// Backend that emits the framebuffer plane unencoded.
///
/// Useful on hosts without an encode engine and as the backend for tests
/// and demos. Frames are marked keyframes only when the session asks for
/// one, so downstream queue and catch-up behavior matches a real codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyEncoder;

impl CopyEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl EncoderCapability for CopyEncoder {
    fn encode(&self, job: EncodeJob) {
        let payload = {
            let fb = job.framebuffer();
            let len = (fb.stride_bytes as usize).saturating_mul(fb.height as usize);
            fb.plane.slice(..len.min(fb.plane.len()))
        };
        let unit = EncodedAccessUnit {
            payload,
            is_keyframe: job.force_keyframe(),
        };
        job.complete(Ok(unit));
    }
}
