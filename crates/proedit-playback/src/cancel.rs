//! Epoch-based cancellation.
//!
//! A [`CancelSource`] owns an epoch counter; every [`CancelToken`] it hands
//! out remembers the epoch it was issued at. Cancelling bumps the epoch, which
//! invalidates every token issued before it in one atomic step. Completion
//! callbacks check their token before touching shared state, so work from a
//! superseded session can never write into the new one.

use proedit_core::{ProEditError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Issues and invalidates [`CancelToken`]s.
#[derive(Debug, Clone, Default)]
pub struct CancelSource {
    epoch: Arc<AtomicU64>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token valid until the next [`cancel`](Self::cancel).
    pub fn token(&self) -> CancelToken {
        CancelToken {
            epoch: Arc::clone(&self.epoch),
            issued: self.epoch.load(Ordering::Acquire),
        }
    }

    /// Invalidate every outstanding token. Returns the new epoch.
    pub fn cancel(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Cheap, clonable "is this work still wanted" check.
#[derive(Debug, Clone)]
pub struct CancelToken {
    epoch: Arc<AtomicU64>,
    issued: u64,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.epoch.load(Ordering::Acquire) != self.issued
    }

    /// `Err(Cancelled)` once the source has moved on.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ProEditError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Epoch this token belongs to.
    pub fn generation(&self) -> u64 {
        self.issued
    }
}
