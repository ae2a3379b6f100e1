use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Shared counters the event subscriber writes and the query service reads for
/// `stats()`/`summary()`. Kept as a small atomics struct rather than a channel since
/// both sides only ever need the latest value, never a history.
#[derive(Default)]
pub struct PipelineStats {
    events_processed: AtomicU64,
    last_event_ts_ms: AtomicI64,
}

impl PipelineStats {
    pub fn record_event(&self, at: DateTime<Utc>) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.last_event_ts_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn last_event_ts(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_event_ts_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }
}
