//! Channel-activity tracking for CSMA-style deferral.
//!
//! A KISS TNC does not report data-carrier-detect explicitly, so receive
//! traffic is used as the busy signal: any bytes arriving from the TNC mean
//! someone is on frequency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
struct Inner {
    epoch: Instant,
    /// Milliseconds since `epoch` of the last observed activity; 0 = never.
    last_activity_ms: AtomicU64,
}

/// Cheap shared handle; cloned into the TNC reader and the TX scheduler.
#[derive(Debug, Clone)]
pub struct CarrierSense {
    inner: Arc<Inner>,
}

impl CarrierSense {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                epoch: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    /// Record receive activity on the channel.
    pub fn mark_activity(&self) {
        // Keep the stored value nonzero so "never" stays distinguishable.
        let now = self.now_ms().max(1);
        self.inner.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// True if activity was observed within the last `window_ms` milliseconds.
    pub fn busy_within(&self, window_ms: u64) -> bool {
        let last = self.inner.last_activity_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        self.now_ms().saturating_sub(last) < window_ms
    }
}

impl Default for CarrierSense {
    fn default() -> Self {
        Self::new()
    }
}
