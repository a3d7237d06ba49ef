use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MetaError, Result};

/// Caller identity plus a cancellation flag shared with whoever may abort the call.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_ids(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Long scans call this between steps.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MetaError::Cancelled)
        } else {
            Ok(())
        }
    }
}
