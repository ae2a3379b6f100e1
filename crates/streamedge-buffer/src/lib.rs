//! Streaming buffer: collapses bursty per-(kind,key) arrivals into at most one
//! record per flush cycle, then hands the whole batch to whatever sink the
//! orchestrator wired in (the broadcaster).
//!
//! Dedup is by key identity only, within the current flush cycle. An earlier design
//! keyed dedup on a wall-clock window against a timestamp field the payload never
//! reliably carried, which starved aggregation indefinitely; there is no timestamp
//! comparison anywhere in this crate.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{IntCounter, register_int_counter};
use streamedge_types::event::{Event, EventKind};
use tracing::warn;

static BUFFER_OVERFLOW: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_buffer_overflow_total",
        "Buffered records dropped because a per-kind buffer was at capacity"
    )
    .expect("metric registration never fails twice for the same name")
});

pub type Key = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    High = 1,
}

impl Priority {
    /// Patterns at or above 0.8 confidence are priority 1.
    pub fn for_pattern_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            Priority::High
        } else {
            Priority::Low
        }
    }
}

struct BufferedRecord {
    latest_event: Event,
    priority: Priority,
    seq: usize,
}

struct KindBuffer {
    records: std::collections::HashMap<Key, BufferedRecord>,
    order: VecDeque<Key>,
}

impl KindBuffer {
    fn new() -> Self {
        Self {
            records: std::collections::HashMap::new(),
            order: VecDeque::new(),
        }
    }
}

/// A flushed batch for one event kind, ordered priority-high-first, insertion order
/// within each priority tier.
pub struct FlushBatch {
    pub kind: EventKind,
    pub items: Vec<Event>,
}

/// Receives flushed batches. Implemented by whatever owns fan-out to clients;
/// kept as a trait object here so this crate never depends on the broadcaster crate.
pub trait BufferSink: Send + Sync {
    fn on_flush(&self, batch: FlushBatch);
}

pub struct StreamingBuffer {
    kinds: DashMap<EventKind, Mutex<KindBuffer>>,
    max_per_kind: usize,
    seq: AtomicUsize,
    sink: std::sync::Arc<dyn BufferSink>,
}

impl StreamingBuffer {
    pub fn new(max_per_kind: usize, sink: std::sync::Arc<dyn BufferSink>) -> Self {
        Self {
            kinds: DashMap::new(),
            max_per_kind,
            seq: AtomicUsize::new(0),
            sink,
        }
    }

    /// Aggregates one arrival. At most one [`BufferedRecord`] exists per (kind,key)
    /// between flushes; a repeated add overwrites `latest_event` in place.
    pub fn add(&self, kind: EventKind, key: Key, event: Event, priority: Priority) {
        let kind_buffer = self
            .kinds
            .entry(kind)
            .or_insert_with(|| Mutex::new(KindBuffer::new()));
        let mut buffer = kind_buffer.lock();

        if !buffer.records.contains_key(&key) {
            if buffer.records.len() >= self.max_per_kind && self.max_per_kind > 0 {
                if let Some(oldest_key) = buffer.order.pop_front() {
                    buffer.records.remove(&oldest_key);
                    BUFFER_OVERFLOW.inc();
                    warn!(?kind, "streaming buffer at capacity, dropped oldest record");
                }
            }
            buffer.order.push_back(key.clone());
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        buffer.records.insert(
            key,
            BufferedRecord {
                latest_event: event,
                priority,
                seq,
            },
        );
    }

    /// One flush cycle: drains every (kind,key) record accumulated since the last
    /// flush and hands each kind's batch to the sink. An empty kind emits nothing
    /// (no heartbeat on an idle buffer).
    pub fn flush(&self) {
        for entry in self.kinds.iter() {
            let kind = *entry.key();
            let mut buffer = entry.value().lock();
            if buffer.records.is_empty() {
                continue;
            }
            let mut drained: Vec<BufferedRecord> = buffer.records.drain().map(|(_, v)| v).collect();
            buffer.order.clear();
            drop(buffer);

            // priority-1 records before priority-0, insertion order within each tier.
            drained.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            let items = drained.into_iter().map(|r| r.latest_event).collect();
            self.sink.on_flush(FlushBatch { kind, items });
        }
    }
}

/// Spawns the single fixed-interval flush task for this buffer.
pub fn spawn_flush_task(
    buffer: std::sync::Arc<StreamingBuffer>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            buffer.flush();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    fn pattern_event(id: &str, symbol: &str, confidence: f64) -> Event {
        Event::PatternDetected {
            id: id.into(),
            symbol: symbol.into(),
            pattern_name: "Doji".into(),
            tier: streamedge_types::event::Tier::Daily,
            confidence,
            detected_at: Utc::now(),
            expires_at: None,
            attributes: Default::default(),
        }
    }

    struct CollectingSink {
        batches: Arc<StdMutex<Vec<FlushBatch>>>,
    }

    impl BufferSink for CollectingSink {
        fn on_flush(&self, batch: FlushBatch) {
            self.batches.lock().unwrap().push(batch);
        }
    }

    #[test]
    fn buffer_flush_aggregation() {
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(CollectingSink {
            batches: batches.clone(),
        });
        let buffer = StreamingBuffer::new(100, sink);

        buffer.add(
            EventKind::Pattern,
            ("AAPL".into(), "Doji".into()),
            pattern_event("a1", "AAPL", 0.70),
            Priority::Low,
        );
        buffer.add(
            EventKind::Pattern,
            ("AAPL".into(), "Doji".into()),
            pattern_event("a2", "AAPL", 0.85),
            Priority::High,
        );
        buffer.add(
            EventKind::Pattern,
            ("NVDA".into(), "Doji".into()),
            pattern_event("a3", "NVDA", 0.60),
            Priority::Low,
        );

        buffer.flush();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.items[0].confidence(), Some(0.85));
        assert_eq!(batch.items[1].confidence(), Some(0.60));
    }

    #[test]
    fn empty_buffer_emits_nothing_on_flush() {
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(CollectingSink {
            batches: batches.clone(),
        });
        let buffer = StreamingBuffer::new(100, sink);
        buffer.flush();
        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn overflow_evicts_the_oldest_key_added_this_cycle() {
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(CollectingSink {
            batches: batches.clone(),
        });
        let buffer = StreamingBuffer::new(2, sink);

        buffer.add(
            EventKind::Pattern,
            ("AAPL".into(), "Doji".into()),
            pattern_event("a1", "AAPL", 0.5),
            Priority::Low,
        );
        buffer.add(
            EventKind::Pattern,
            ("MSFT".into(), "Hammer".into()),
            pattern_event("a2", "MSFT", 0.5),
            Priority::Low,
        );
        buffer.add(
            EventKind::Pattern,
            ("NVDA".into(), "Doji".into()),
            pattern_event("a3", "NVDA", 0.5),
            Priority::Low,
        );

        buffer.flush();
        let batches = batches.lock().unwrap();
        let symbols: Vec<Option<&str>> = batches[0].items.iter().map(|e| e.symbol()).collect();
        assert_eq!(symbols.len(), 2);
        assert!(!symbols.contains(&Some("AAPL")));
    }

    #[test]
    fn repeated_add_for_same_key_keeps_only_latest_event() {
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(CollectingSink {
            batches: batches.clone(),
        });
        let buffer = StreamingBuffer::new(100, sink);

        for confidence in [0.1, 0.2, 0.95] {
            buffer.add(
                EventKind::Pattern,
                ("AAPL".into(), "Doji".into()),
                pattern_event("a1", "AAPL", confidence),
                Priority::Low,
            );
        }
        buffer.flush();

        let batches = batches.lock().unwrap();
        assert_eq!(batches[0].items.len(), 1);
        assert_eq!(batches[0].items[0].confidence(), Some(0.95));
    }
}
