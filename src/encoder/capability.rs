//! The encoder capability seam.
//!
//! [`EncoderCapability`] is the trait a backend implements to turn dirty
//! framebuffers into encoded access units. The manager hands it an
//! [`EncodeJob`] per damage report; the backend calls [`EncodeJob::complete`]
//! whenever the bitstream is ready, on whatever thread it likes.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EncoderError;

use super::fence::FenceSignal;

/// A guest framebuffer scheduled for encoding.
///
/// `plane` holds at least `stride_bytes * height` bytes of pixel data.
/// The handle is cheap to clone; the plane is reference-counted.
#[derive(Debug, Clone)]
pub struct FramebufferHandle {
    pub resource_id: u32,
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    pub plane: Bytes,
}

impl FramebufferHandle {
    pub fn new(resource_id: u32, width: u32, height: u32, stride_bytes: u32, plane: Bytes) -> Self {
        Self {
            resource_id,
            width,
            height,
            stride_bytes,
            plane,
        }
    }
}

/// One encoded bitstream unit produced by a backend.
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    pub payload: Bytes,
    pub is_keyframe: bool,
}

/// Outcome of one encode job, routed back to the manager's drain task.
#[derive(Debug)]
pub(crate) struct Completion {
    pub slot: u32,
    pub generation: u64,
    pub timestamp_us: u64,
    pub result: Result<EncodedAccessUnit, EncoderError>,
}

/// Sender half used by jobs to report their completion.
#[derive(Clone)]
pub(crate) struct CompletionSink {
    tx: mpsc::Sender<Completion>,
}

impl CompletionSink {
    pub(crate) fn new(tx: mpsc::Sender<Completion>) -> Self {
        Self { tx }
    }

    /// Never blocks: encoder backends may call this from interrupt-ish
    /// contexts. Overflow drops the completion and logs it.
    pub(crate) fn deliver(&self, completion: Completion) {
        match self.tx.try_send(completion) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(c)) => {
                let err = EncoderError::CompletionOverflow(c.slot);
                warn!(slot = c.slot, error = %err, "Dropping encode completion");
            }
            Err(mpsc::error::TrySendError::Closed(c)) => {
                debug!(slot = c.slot, "Completion channel closed; manager gone");
            }
        }
    }
}

/// A single encode request.
///
/// The job owns the framebuffer's release fence: completing the job (or
/// calling [`release_framebuffer`](Self::release_framebuffer) early, once
/// the pixels have been read) unblocks the producer.
pub struct EncodeJob {
    slot: u32,
    generation: u64,
    timestamp_us: u64,
    force_keyframe: bool,
    framebuffer: FramebufferHandle,
    fence: Option<FenceSignal>,
    sink: CompletionSink,
}

impl EncodeJob {
    pub(crate) fn new(
        slot: u32,
        generation: u64,
        timestamp_us: u64,
        force_keyframe: bool,
        framebuffer: FramebufferHandle,
        fence: FenceSignal,
        sink: CompletionSink,
    ) -> Self {
        Self {
            slot,
            generation,
            timestamp_us,
            force_keyframe,
            framebuffer,
            fence: Some(fence),
            sink,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The session requires this job to produce a keyframe.
    pub fn force_keyframe(&self) -> bool {
        self.force_keyframe
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn framebuffer(&self) -> &FramebufferHandle {
        &self.framebuffer
    }

    /// Release the framebuffer before the bitstream is ready. Backends
    /// that copy or DMA the pixels up front call this so the producer can
    /// reuse the buffer while encoding continues.
    pub fn release_framebuffer(&mut self) {
        if let Some(fence) = self.fence.take() {
            fence.completed();
        }
    }

    /// Finish the job. Releases the framebuffer if it has not been
    /// released yet and reports the result to the manager.
    pub fn complete(mut self, result: Result<EncodedAccessUnit, EncoderError>) {
        self.release_framebuffer();
        self.sink.deliver(Completion {
            slot: self.slot,
            generation: self.generation,
            timestamp_us: self.timestamp_us,
            result,
        });
    }
}

/// Backend that performs the actual encoding.
///
/// `encode` must not block for long: it runs on the damage reporter's
/// thread. Hardware backends submit the job to their own queue and return;
/// completion arrives later via [`EncodeJob::complete`]. Dropping a job
/// without completing it releases the framebuffer but produces no frame.
#[cfg_attr(test, mockall::automock)]
pub trait EncoderCapability: Send + Sync + 'static {
    fn encode(&self, job: EncodeJob);
}
