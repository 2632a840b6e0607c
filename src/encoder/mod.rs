//! Encode pipeline: damage in, sequenced frames out.
//!
//! ```text
//! producer thread                      runtime
//! ---------------                      -------
//! on_damage(slot, fb)
//!   └─► EncodeJob ─► EncoderCapability::encode()
//!                        │ (backend thread, any time later)
//!                        └─► job.complete(result)
//!                               └─► completion channel ─► drain task
//!                                      assigns sequence, hub.push_frame()
//! ```
//!
//! The producer gets a [`ReleaseFence`] back from `on_damage` and waits on
//! it before reusing the framebuffer. Backends implement
//! [`EncoderCapability`]; [`CopyEncoder`] is the built-in pass-through.

pub mod capability;
pub mod copy;
pub mod fence;
pub mod manager;
mod session;

pub use capability::{EncodeJob, EncodedAccessUnit, EncoderCapability, FramebufferHandle};
pub use copy::CopyEncoder;
pub use fence::ReleaseFence;
pub use manager::{EncoderConfig, EncoderSessions, SlotFault};
