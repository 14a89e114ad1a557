//! Live-adjustable request timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared handle to the per-request timeout.
///
/// Every call site reads the value at the moment it issues a request, so
/// `set` takes effect for all subsequent requests on a live connection
/// without reconnecting.
#[derive(Debug, Clone)]
pub struct RequestTimeout {
    secs: Arc<AtomicU64>,
}

impl RequestTimeout {
    #[must_use]
    pub fn new(secs: u64) -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(secs)),
        }
    }

    #[must_use]
    pub fn get(&self) -> Duration {
        Duration::from_secs(self.secs.load(Ordering::Relaxed))
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::Relaxed);
    }
}

impl Default for RequestTimeout {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT_SECS)
    }
}
