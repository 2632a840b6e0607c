//! Framebuffer release fences.
//!
//! The producer that reports damage must not reuse the framebuffer until
//! the encoder has consumed the pixels. [`fence_pair`] splits that contract
//! in two: the encode path holds the [`FenceSignal`], the producer keeps
//! the [`ReleaseFence`] and waits on it.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::warn;

struct FenceShared {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl FenceShared {
    fn signal(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        drop(signaled);
        self.cond.notify_all();
    }
}

pub(crate) fn fence_pair() -> (FenceSignal, ReleaseFence) {
    let shared = Arc::new(FenceShared {
        signaled: Mutex::new(false),
        cond: Condvar::new(),
    });
    (
        FenceSignal {
            shared: Some(Arc::clone(&shared)),
        },
        ReleaseFence { shared },
    )
}

/// Completion side of a fence. Consumed exactly once.
///
/// Dropping an uncompleted signal still releases the waiter, so a panicking
/// encode path cannot strand the producer, but it logs loudly because the
/// framebuffer may still have been in use.
pub(crate) struct FenceSignal {
    shared: Option<Arc<FenceShared>>,
}

impl FenceSignal {
    pub(crate) fn completed(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.signal();
        }
    }
}

impl Drop for FenceSignal {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            warn!("Encode fence dropped without completion; releasing framebuffer anyway");
            shared.signal();
        }
    }
}

/// Producer side of a fence.
///
/// Waiting blocks the calling thread. Producers report damage from their
/// own threads, not from the runtime, so a blocking wait is the right
/// shape here.
pub struct ReleaseFence {
    shared: Arc<FenceShared>,
}

impl ReleaseFence {
    pub fn is_signaled(&self) -> bool {
        *self
            .shared
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the framebuffer is released.
    pub fn wait(&self) {
        let mut signaled = self
            .shared
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .shared
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until released or the timeout elapses. Returns whether the
    /// fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self
            .shared
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let deadline = std::time::Instant::now() + timeout;
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .shared
                .cond
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_signals_waiter() {
        let (signal, release) = fence_pair();
        assert!(!release.is_signaled());
        signal.completed();
        assert!(release.is_signaled());
        release.wait();
    }

    #[test]
    fn test_drop_signals_waiter() {
        let (signal, release) = fence_pair();
        drop(signal);
        assert!(release.is_signaled());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (_signal, release) = fence_pair();
        assert!(!release.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_across_threads() {
        let (signal, release) = fence_pair();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signal.completed();
        });
        assert!(release.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }
}
