//! Shared cancellation token.
//!
//! The VM owns one token per program run; every core observes it at its
//! virtual-cycle boundaries and blocking builtins (`sleep`) poll it in small
//! slices. Cancellation is cooperative and carries a cause: the first caller
//! to cancel wins, later causes are ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    cause: Arc<Mutex<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation. The first cause wins.
    pub fn cancel(&self, cause: impl Into<String>) {
        let mut guard = self.cause.lock();
        if guard.is_none() {
            *guard = Some(cause.into());
        }
        drop(guard);
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The recorded cause, once cancelled.
    pub fn cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }

    /// Attach an external deadline: after `timeout` the token cancels itself
    /// with a timeout cause. Expiry of an already-cancelled token is a no-op.
    pub fn set_deadline(&self, timeout: Duration) {
        let token = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if !token.is_cancelled() {
                token.cancel(format!("maximum runtime of {:?} exceeded", timeout));
            }
        });
    }

    /// Sleep for `duration` in small slices, waking early on cancellation.
    /// Returns `false` when the sleep was interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(SLICE);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_cancelled()
    }
}
