//! Broadcaster: matches events against the subscription index,
//! shards delivery across N worker tasks by `client_id` so per-client ordering holds
//! regardless of which producer called [`Broadcaster::broadcast`], and applies a
//! per-client token-bucket rate limit before handing a [`ServerEvent`] to the
//! session's own delivery channel.
//!
//! A client_id always hashes to the same shard, so a single-consumer queue per shard
//! is enough to preserve per-client delivery order without a flat connection table
//! scanned on every call.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};
use streamedge_buffer::{BufferSink, FlushBatch};
use streamedge_subindex::SubscriptionIndex;
use streamedge_types::event::{Event, EventKind};
use streamedge_types::wire::{Calculation, Detection, ServerEvent};
use streamedge_types::ClientSession;
use tokio::sync::mpsc;
use tracing::{debug, warn};

static CONNECTED_CLIENTS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "streamedge_connected_clients",
        "Number of registered client sessions"
    )
    .expect("metric registration never fails twice for the same name")
});

static DROPPED_RATE_LIMIT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_dropped_rate_limit_total",
        "Events dropped because a client's rolling-second budget was exhausted"
    )
    .expect("metric registration never fails twice for the same name")
});

static DROPPED_SEND_DEADLINE: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_dropped_send_deadline_total",
        "Events dropped because a per-session send missed its soft deadline"
    )
    .expect("metric registration never fails twice for the same name")
});

struct SessionHandle {
    sender: mpsc::Sender<ServerEvent>,
    rooms: parking_lot::RwLock<HashSet<String>>,
}

enum ShardJob {
    Deliver { client_id: String, event: ServerEvent },
}

pub struct BroadcasterConfig {
    pub shard_count: usize,
    pub rate_limit_per_sec: u32,
    pub per_send_deadline: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            rate_limit_per_sec: 100,
            per_send_deadline: Duration::from_millis(50),
        }
    }
}

pub struct Broadcaster {
    index: std::sync::Arc<SubscriptionIndex>,
    sessions: DashMap<String, SessionHandle>,
    rooms: DashMap<String, HashSet<String>>,
    shards: Vec<mpsc::UnboundedSender<ShardJob>>,
    rate_limit_per_sec: u32,
}

impl Broadcaster {
    pub fn new(index: std::sync::Arc<SubscriptionIndex>, config: BroadcasterConfig) -> std::sync::Arc<Self> {
        let sessions: DashMap<String, SessionHandle> = DashMap::new();
        let mut shards = Vec::with_capacity(config.shard_count.max(1));
        let mut rx_list = Vec::with_capacity(shards.capacity());
        for _ in 0..config.shard_count.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(tx);
            rx_list.push(rx);
        }

        let broadcaster = std::sync::Arc::new(Self {
            index,
            sessions,
            rooms: DashMap::new(),
            shards,
            rate_limit_per_sec: config.rate_limit_per_sec,
        });

        for rx in rx_list {
            spawn_shard_worker(
                std::sync::Arc::clone(&broadcaster),
                rx,
                config.rate_limit_per_sec,
                config.per_send_deadline,
            );
        }

        broadcaster
    }

    /// Registers a new client session. Must be paired with [`Broadcaster::remove_session`]
    /// on disconnect, which tears down subscriptions and room membership for the client.
    pub fn register_session(&self, client_id: &str, sender: mpsc::Sender<ServerEvent>) {
        self.sessions.insert(
            client_id.to_string(),
            SessionHandle {
                sender,
                rooms: parking_lot::RwLock::new(HashSet::new()),
            },
        );
        CONNECTED_CLIENTS.set(self.sessions.len() as i64);
    }

    /// Tears down everything this client owns: session handle, room memberships, and
    /// its subscription-index entry. Disconnect destroys all three together.
    pub fn remove_session(&self, client_id: &str) {
        if let Some((_, handle)) = self.sessions.remove(client_id) {
            for room in handle.rooms.read().iter() {
                if let Some(mut members) = self.rooms.get_mut(room) {
                    members.remove(client_id);
                }
            }
        }
        self.index.unsubscribe(client_id);
        CONNECTED_CLIENTS.set(self.sessions.len() as i64);
    }

    pub fn join_room(&self, client_id: &str, room: &str) {
        if let Some(session) = self.sessions.get(client_id) {
            session.rooms.write().insert(room.to_string());
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    pub fn leave_room(&self, client_id: &str, room: &str) {
        if let Some(session) = self.sessions.get(client_id) {
            session.rooms.write().remove(room);
        }
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(client_id);
        }
    }

    /// Matches `event` against the subscription index and enqueues it to every
    /// matching client's shard. Safe to call concurrently from multiple producers
    /// (EventSubscriber direct dispatch, StreamingBuffer flush).
    pub fn broadcast(&self, event: &Event) {
        let clients = self.index.matching_clients(event);
        if clients.is_empty() {
            return;
        }
        let Some(server_event) = single_server_event(event) else {
            return;
        };
        for client_id in clients {
            self.enqueue(client_id, server_event.clone());
        }
    }

    /// Delivers a room's members a `pattern_alert` irrespective of their subscription
    /// predicate. Rooms are an orthogonal, explicitly-joined multicast mechanism.
    /// The primary pattern/indicator fan-out path is always subscription matching,
    /// never room membership.
    pub fn broadcast_to_room(&self, room: &str, detection: Detection, rule: &str) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        let event = ServerEvent::PatternAlert {
            detection,
            rule: rule.to_string(),
        };
        for client_id in members.iter() {
            self.enqueue(client_id.clone(), event.clone());
        }
    }

    /// Batched delivery from the streaming buffer. The envelope for a given client
    /// contains only the items from this batch the client's predicate admits; a
    /// client that admits nothing from the batch gets no envelope at all.
    fn broadcast_batch(&self, batch: FlushBatch) {
        if batch.items.is_empty() {
            return;
        }
        // group admitted items per client without re-running the full match
        // algorithm per item: compute matches once per item, then invert.
        let mut per_client: std::collections::HashMap<String, Vec<&Event>> = std::collections::HashMap::new();
        for event in &batch.items {
            for client_id in self.index.matching_clients(event) {
                per_client.entry(client_id).or_default().push(event);
            }
        }
        for (client_id, events) in per_client {
            let Some(envelope) = batch_envelope(batch.kind, events) else {
                continue;
            };
            self.enqueue(client_id, envelope);
        }
    }

    fn enqueue(&self, client_id: String, event: ServerEvent) {
        let shard = shard_for(&client_id, self.shards.len());
        if self.shards[shard]
            .send(ShardJob::Deliver { client_id, event })
            .is_err()
        {
            warn!("broadcaster shard worker channel closed");
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.sessions.len()
    }

    pub fn healthy(&self) -> bool {
        !self.shards.is_empty()
    }
}

/// Adapts [`Broadcaster`] to the [`BufferSink`] contract so the streaming buffer can
/// hand it flushed batches without depending on this crate.
pub struct BroadcasterSink(pub std::sync::Arc<Broadcaster>);

impl BufferSink for BroadcasterSink {
    fn on_flush(&self, batch: FlushBatch) {
        self.0.broadcast_batch(batch);
    }
}

fn shard_for(client_id: &str, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    client_id.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count.max(1)
}

fn single_server_event(event: &Event) -> Option<ServerEvent> {
    match event {
        Event::PatternDetected { .. } => Some(ServerEvent::StreamingPattern {
            detection: detection_from_event(event)?,
        }),
        Event::IndicatorCalculated { .. } => Some(ServerEvent::StreamingIndicator {
            calculation: calculation_from_event(event)?,
        }),
        Event::StreamingHealth { status, .. } => Some(ServerEvent::StatusUpdate {
            status: serde_json::json!({ "status": status }),
        }),
        Event::SessionLifecycle { .. }
        | Event::BacktestProgress { .. }
        | Event::BacktestResult { .. }
        | Event::CriticalAlert { .. } => None,
    }
}

fn batch_envelope(kind: EventKind, events: Vec<&Event>) -> Option<ServerEvent> {
    let timestamp = Utc::now();
    match kind {
        EventKind::Pattern => {
            let patterns: Vec<Detection> = events.into_iter().filter_map(detection_from_event).collect();
            if patterns.is_empty() {
                return None;
            }
            Some(ServerEvent::StreamingPatternsBatch {
                count: patterns.len(),
                patterns,
                timestamp,
            })
        }
        EventKind::Indicator => {
            let indicators: Vec<Calculation> =
                events.into_iter().filter_map(calculation_from_event).collect();
            if indicators.is_empty() {
                return None;
            }
            Some(ServerEvent::StreamingIndicatorsBatch {
                count: indicators.len(),
                indicators,
                timestamp,
            })
        }
        _ => None,
    }
}

fn detection_from_event(event: &Event) -> Option<Detection> {
    match event {
        Event::PatternDetected {
            pattern_name,
            symbol,
            confidence,
            detected_at,
            tier,
            ..
        } => Some(Detection {
            pattern_name: pattern_name.clone(),
            symbol: symbol.clone(),
            confidence: *confidence,
            detected_at: *detected_at,
            tier: *tier,
        }),
        _ => None,
    }
}

fn calculation_from_event(event: &Event) -> Option<Calculation> {
    match event {
        Event::IndicatorCalculated {
            indicator_name,
            symbol,
            value,
            computed_at,
            timeframe,
            ..
        } => Some(Calculation {
            indicator_name: indicator_name.clone(),
            symbol: symbol.clone(),
            values: value.clone(),
            computed_at: *computed_at,
            timeframe: timeframe.clone(),
        }),
        _ => None,
    }
}

fn spawn_shard_worker(
    broadcaster: std::sync::Arc<Broadcaster>,
    mut rx: mpsc::UnboundedReceiver<ShardJob>,
    rate_limit_per_sec: u32,
    per_send_deadline: Duration,
) {
    tokio::spawn(async move {
        // Rate-limit state is local to this task: a client_id always hashes to the
        // same shard, so no other task ever touches this client's bucket.
        let mut buckets: std::collections::HashMap<String, ClientSession> = std::collections::HashMap::new();

        while let Some(job) = rx.recv().await {
            let ShardJob::Deliver { client_id, event } = job;

            if !take_token(&mut buckets, &client_id, rate_limit_per_sec) {
                DROPPED_RATE_LIMIT.inc();
                debug!(%client_id, "dropped event: rate limit exhausted");
                continue;
            }

            let Some(session) = broadcaster.sessions.get(&client_id) else {
                continue;
            };
            let sender = session.sender.clone();
            drop(session);

            match tokio::time::timeout(per_send_deadline, sender.send(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(%client_id, "session channel closed, dropping delivery");
                }
                Err(_) => {
                    DROPPED_SEND_DEADLINE.inc();
                    warn!(%client_id, "per-session send missed soft deadline, dropped");
                }
            }
        }
    });
}

/// Token-bucket check: refills continuously based on elapsed wall-clock time since
/// the client's last emit, capped at `rate_limit_per_sec` tokens.
fn take_token(
    buckets: &mut std::collections::HashMap<String, ClientSession>,
    client_id: &str,
    rate_limit_per_sec: u32,
) -> bool {
    let now = Utc::now();
    let session = buckets
        .entry(client_id.to_string())
        .or_insert_with(|| ClientSession::new(client_id, "", rate_limit_per_sec));

    if let Some(last) = session.last_emit_ts {
        let elapsed = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
        let refill = (elapsed * rate_limit_per_sec as f64) as u32;
        session.rate_budget_remaining = (session.rate_budget_remaining + refill).min(rate_limit_per_sec);
    }
    session.last_emit_ts = Some(now);

    if session.rate_budget_remaining == 0 {
        return false;
    }
    session.rate_budget_remaining -= 1;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use streamedge_types::event::Tier;
    use streamedge_types::subscription::Predicate;

    fn pattern_event(symbol: &str, confidence: f64) -> Event {
        Event::PatternDetected {
            id: "p1".into(),
            symbol: symbol.into(),
            pattern_name: "Doji".into(),
            tier: Tier::Daily,
            confidence,
            detected_at: Utc::now(),
            expires_at: None,
            attributes: Default::default(),
        }
    }

    async fn wait_for<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn matched_event_is_delivered_to_subscriber() {
        let index = Arc::new(SubscriptionIndex::new());
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: HashSet::from([EventKind::Pattern]),
                ..Default::default()
            },
        );
        let broadcaster = Broadcaster::new(index, BroadcasterConfig::default());
        let (tx, mut rx) = mpsc::channel(10);
        broadcaster.register_session("c1", tx);

        broadcaster.broadcast(&pattern_event("AAPL", 0.9));

        match wait_for(&mut rx).await {
            ServerEvent::StreamingPattern { detection } => assert_eq!(detection.symbol, "AAPL"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_matching_client_receives_nothing() {
        let index = Arc::new(SubscriptionIndex::new());
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: HashSet::from([EventKind::Pattern]),
                symbols: Some(HashSet::from(["MSFT".to_string()])),
                ..Default::default()
            },
        );
        let broadcaster = Broadcaster::new(index, BroadcasterConfig::default());
        let (tx, mut rx) = mpsc::channel(10);
        broadcaster.register_session("c1", tx);

        broadcaster.broadcast(&pattern_event("AAPL", 0.9));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    /// 15 events at a rate limit of 10/sec yields exactly 10 delivered.
    #[tokio::test]
    async fn rate_limit_drops_excess_events() {
        let index = Arc::new(SubscriptionIndex::new());
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: HashSet::from([EventKind::Pattern]),
                ..Default::default()
            },
        );
        let broadcaster = Broadcaster::new(
            index,
            BroadcasterConfig {
                shard_count: 1,
                rate_limit_per_sec: 10,
                per_send_deadline: Duration::from_millis(50),
            },
        );
        let (tx, mut rx) = mpsc::channel(100);
        broadcaster.register_session("c1", tx);

        for _ in 0..15 {
            broadcaster.broadcast(&pattern_event("AAPL", 0.9));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 10);
    }

    #[tokio::test]
    async fn disconnect_removes_subscription_and_room_membership() {
        let index = Arc::new(SubscriptionIndex::new());
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: HashSet::from([EventKind::Pattern]),
                ..Default::default()
            },
        );
        let broadcaster = Broadcaster::new(index, BroadcasterConfig::default());
        let (tx, _rx) = mpsc::channel(10);
        broadcaster.register_session("c1", tx);
        broadcaster.join_room("c1", "watchlist");

        broadcaster.remove_session("c1");

        assert_eq!(broadcaster.connected_clients(), 0);
        assert!(broadcaster.rooms.get("watchlist").unwrap().is_empty());
        assert!(broadcaster.index.matching_clients(&pattern_event("AAPL", 0.9)).is_empty());
    }
}
