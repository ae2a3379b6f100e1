//! Event subscriber: subscribes to the bus topic set via the connection pool,
//! decodes each message, and dispatches the normalized [`Event`] to the pattern
//! cache, the streaming buffer, or straight to the broadcaster for kinds that
//! bypass aggregation.
//!
//! Per-message errors are isolated: a background loop logs and continues on any
//! single bad message, never propagating an error upward and never exiting on one.

pub mod decode;

use std::sync::Arc;
use std::sync::LazyLock;

use prometheus::{IntCounter, register_int_counter};
use streamedge_broadcaster::Broadcaster;
use streamedge_buffer::{Priority, StreamingBuffer};
use streamedge_bus::{BusEvent, ConnectionPool};
use streamedge_cache::PatternCache;
use streamedge_types::event::{Event, EventKind, LifecycleKind};
use streamedge_types::PipelineStats;
use tracing::{debug, info, warn};

static DECODE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_decode_errors_total",
        "Messages dropped because they failed to decode as JSON"
    )
    .expect("metric registration never fails twice for the same name")
});

static DROPPED_MISSING_FIELD: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_dropped_missing_field_total",
        "Messages dropped because a required scoping field was absent"
    )
    .expect("metric registration never fails twice for the same name")
});

static EVENTS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_events_processed_total",
        "Events successfully decoded and dispatched"
    )
    .expect("metric registration never fails twice for the same name")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    PatternStreaming,
    PatternDetected,
    IndicatorStreaming,
    Health,
    SessionStarted,
    SessionStopped,
    CriticalAlert,
    BacktestProgress,
    BacktestResult,
}

/// Default logical channel names. Deployment-specific, not fixed at the wire level.
fn default_topics() -> Vec<(String, Topic)> {
    vec![
        ("patterns.streaming".to_string(), Topic::PatternStreaming),
        ("patterns.detected".to_string(), Topic::PatternDetected),
        ("indicators.streaming".to_string(), Topic::IndicatorStreaming),
        ("streaming.health".to_string(), Topic::Health),
        ("streaming.session_started".to_string(), Topic::SessionStarted),
        ("streaming.session_stopped".to_string(), Topic::SessionStopped),
        ("alerts.critical".to_string(), Topic::CriticalAlert),
        ("backtesting.progress".to_string(), Topic::BacktestProgress),
        ("backtesting.results".to_string(), Topic::BacktestResult),
    ]
}

pub struct EventSubscriber {
    pool: Arc<ConnectionPool>,
    cache: Arc<PatternCache>,
    buffer: Arc<StreamingBuffer>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
    topics: Vec<(String, Topic)>,
}

impl EventSubscriber {
    pub fn new(
        pool: Arc<ConnectionPool>,
        cache: Arc<PatternCache>,
        buffer: Arc<StreamingBuffer>,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            pool,
            cache,
            buffer,
            broadcaster,
            stats,
            topics: default_topics(),
        }
    }

    /// Runs the subscriber loop until the process shuts down. Per-message errors are
    /// isolated: a bad message is logged, counted, and the loop continues. It never
    /// exits on a single bad message.
    pub async fn run(self) {
        let topic_names: Vec<String> = self.topics.iter().map(|(name, _)| name.clone()).collect();
        let mut rx = self.pool.subscribe(topic_names).await;

        info!(topics = ?self.topics.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(), "event subscriber starting");

        while let Some(event) = rx.recv().await {
            match event {
                BusEvent::Reconnected => {
                    info!("bus reconnected; resuming event dispatch");
                }
                BusEvent::Message { topic, payload } => {
                    self.handle_message(&topic, &payload);
                }
            }
        }
        warn!("event subscriber loop exited: bus channel closed");
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some((_, kind)) = self.topics.iter().find(|(name, _)| name == topic) else {
            debug!(%topic, "message on unrecognized topic, dropping");
            return;
        };

        let decoded = match kind {
            Topic::PatternStreaming | Topic::PatternDetected => decode::decode_pattern(payload),
            Topic::IndicatorStreaming => decode::decode_indicator(payload),
            Topic::Health => decode::decode_health(payload),
            Topic::SessionStarted => decode::decode_lifecycle(payload, LifecycleKind::Started),
            Topic::SessionStopped => decode::decode_lifecycle(payload, LifecycleKind::Stopped),
            Topic::CriticalAlert => {
                decode::decode_opaque(payload, |raw| Event::CriticalAlert { payload: raw })
            }
            Topic::BacktestProgress => {
                decode::decode_opaque(payload, |raw| Event::BacktestProgress { payload: raw })
            }
            Topic::BacktestResult => {
                decode::decode_opaque(payload, |raw| Event::BacktestResult { payload: raw })
            }
        };

        match decoded {
            Ok(event) => {
                EVENTS_PROCESSED.inc();
                self.stats.record_event(chrono::Utc::now());
                self.dispatch(event);
            }
            Err(streamedge_types::StreamError::MissingField(field)) => {
                DROPPED_MISSING_FIELD.inc();
                debug!(%topic, %field, "dropped message: missing required scoping field");
            }
            Err(err) => {
                DECODE_ERRORS.inc();
                warn!(%topic, error = %err, "dropped message: decode failure");
            }
        }
    }

    /// Dispatches a decoded event to the cache/buffer (buffered kinds) or straight
    /// to the broadcaster.
    fn dispatch(&self, event: Event) {
        if event.kind() == EventKind::Pattern {
            self.cache.insert_event(&event);
        }

        if event.is_buffered() {
            let Some(symbol) = event.symbol() else {
                return;
            };
            let name = event
                .pattern_name()
                .or_else(|| event.indicator_name())
                .unwrap_or("")
                .to_string();
            let key = (symbol.to_string(), name);
            let priority = match event.confidence() {
                Some(confidence) => Priority::for_pattern_confidence(confidence),
                None => Priority::Low,
            };
            self.buffer.add(event.kind(), key, event, priority);
        } else {
            self.broadcaster.broadcast(&event);
        }
    }
}
