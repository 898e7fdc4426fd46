//! Cooperative cancellation
//!
//! Every loop of the pipeline (file loop, chunk loop, splitter batch loop)
//! polls a [`CancellationToken`] at its head. Raising the token never stops
//! work that was already handed to a worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set-once cancellation flag shared by all stages of one import run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the token. Returns `true` only for the first caller.
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Convenience for loop heads: `while token.should_run() { .. }`
    pub fn should_run(&self) -> bool {
        !self.is_cancelled()
    }
}
