//! Manual time source
//!
//! Lets tests control message timestamps precisely. Timers still run on tokio
//! time; pair with `tokio::time::pause()` for deterministic deadlines.

use florachat_core::{TimeSource, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Clock that only moves when told to
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    current_time: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_at(start_time: u64) -> Self {
        Self {
            current_time: Arc::new(AtomicU64::new(start_time)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.current_time.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set_time(&self, millis: u64) {
        self.current_time.store(millis, Ordering::SeqCst);
    }

    pub fn current_time(&self) -> u64 {
        self.current_time.load(Ordering::SeqCst)
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current_time())
    }
}
