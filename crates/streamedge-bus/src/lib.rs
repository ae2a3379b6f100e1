//! Redis-backed message bus: a thin connection pool over Redis
//! pub/sub with automatic reconnect-with-backoff and a degraded/healthy signal the
//! orchestrator's health aggregation reads.
//!
//! The standalone and cluster clients are kept behind one `RedisEndpoint` enum so the
//! rest of the pipeline can point at either without caring which. TLS (`rediss://`
//! urls) is left to `redis`'s own `tokio-rustls-comp` feature, which installs a
//! default crypto provider on first use.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};
use redis::AsyncCommands;
use redis::cluster::ClusterClient;
use redis::Client;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use streamedge_types::{StreamError, StreamResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEGRADED_AFTER_FAILURES: u32 = 5;
const HEALTHY_WINDOW: Duration = Duration::from_secs(10);

static BUS_RECONNECTS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "streamedge_bus_reconnects_total",
        "Times the bus pub/sub connection was re-established after a drop"
    )
    .expect("metric registration never fails twice for the same name")
});

static BUS_HEALTHY: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "streamedge_bus_healthy",
        "1 if the bus has seen a successful operation within the health window, else 0"
    )
    .expect("metric registration never fails twice for the same name")
});

/// Message delivered to subscribers. `Reconnected` lets downstream consumers (notably
/// the event subscriber) know their view of the bus may have missed messages while down.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Message { topic: String, payload: Vec<u8> },
    Reconnected,
}

enum RedisEndpoint {
    Single(Client),
    Cluster(ClusterClient),
}

pub struct ConnectionPool {
    endpoint: RedisEndpoint,
    topics: Mutex<HashSet<String>>,
    last_success_ms: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl ConnectionPool {
    pub fn new(url: &str) -> StreamResult<Self> {
        let client = Client::open(url)
            .map_err(|err| StreamError::InitError(format!("redis client: {err}")))?;
        info!(%url, "configured single-node redis bus");
        Ok(Self::from_endpoint(RedisEndpoint::Single(client)))
    }

    pub fn new_with_cluster(urls: Vec<String>) -> StreamResult<Self> {
        let client = ClusterClient::new(urls.clone())
            .map_err(|err| StreamError::InitError(format!("redis cluster client: {err}")))?;
        info!(?urls, "configured redis cluster bus");
        Ok(Self::from_endpoint(RedisEndpoint::Cluster(client)))
    }

    fn from_endpoint(endpoint: RedisEndpoint) -> Self {
        Self {
            endpoint,
            topics: Mutex::new(HashSet::new()),
            last_success_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> StreamResult<()> {
        let result: Result<i64, redis::RedisError> = match &self.endpoint {
            RedisEndpoint::Single(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                conn.publish(topic, payload).await
            }
            RedisEndpoint::Cluster(client) => {
                let mut conn = client.get_async_connection().await?;
                conn.publish(topic, payload).await
            }
        };
        match result {
            Ok(_) => {
                self.record_success();
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                Err(StreamError::from(err))
            }
        }
    }

    /// Registers `topics` for delivery and (if not already running) spawns the
    /// background subscriber loop. Returns a channel the caller reads [`BusEvent`]s
    /// from for the lifetime of the pool.
    pub async fn subscribe(self: &Arc<Self>, topics: Vec<String>) -> mpsc::UnboundedReceiver<BusEvent> {
        {
            let mut guard = self.topics.lock().await;
            guard.extend(topics);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber_loop(Arc::clone(self), tx));
        rx
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_success_ms
            .store(now_ms(), Ordering::Release);
        BUS_HEALTHY.set(1);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= DEGRADED_AFTER_FAILURES {
            BUS_HEALTHY.set(0);
        }
    }

    /// Healthy iff a send or receive has succeeded within [`HEALTHY_WINDOW`] and the
    /// pool hasn't accumulated [`DEGRADED_AFTER_FAILURES`] consecutive failures since.
    pub fn is_healthy(&self) -> bool {
        let last = self.last_success_ms.load(Ordering::Acquire);
        let within_window = last != 0 && now_ms().saturating_sub(last) < HEALTHY_WINDOW.as_millis() as u64;
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        within_window && failures < DEGRADED_AFTER_FAILURES
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

async fn run_subscriber_loop(pool: Arc<ConnectionPool>, tx: mpsc::UnboundedSender<BusEvent>) {
    let mut backoff = INITIAL_BACKOFF;
    let mut connected_before = false;

    loop {
        let topics: Vec<String> = {
            let guard = pool.topics.lock().await;
            guard.iter().cloned().collect()
        };
        if topics.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        let outcome = match &pool.endpoint {
            RedisEndpoint::Single(client) => {
                drive_single(client, &topics, &pool, &tx, connected_before).await
            }
            RedisEndpoint::Cluster(client) => {
                drive_cluster(client, &topics, &pool, &tx, connected_before).await
            }
        };

        match outcome {
            Ok(()) => {
                connected_before = true;
                backoff = INITIAL_BACKOFF;
            }
            Err(err) => {
                pool.record_failure();
                warn!(
                    error = %err,
                    delay_ms = backoff.as_millis() as u64,
                    "bus pub/sub connection lost, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn drive_single(
    client: &Client,
    topics: &[String],
    pool: &ConnectionPool,
    tx: &mpsc::UnboundedSender<BusEvent>,
    connected_before: bool,
) -> StreamResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(topics).await?;
    pool.record_success();
    if connected_before {
        BUS_RECONNECTS.inc();
        if tx.send(BusEvent::Reconnected).is_err() {
            return Ok(());
        }
    }
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        pool.record_success();
        let topic = msg.get_channel_name().to_string();
        let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
        if tx.send(BusEvent::Message { topic, payload }).is_err() {
            break;
        }
    }
    Ok(())
}

async fn drive_cluster(
    client: &ClusterClient,
    topics: &[String],
    pool: &ConnectionPool,
    tx: &mpsc::UnboundedSender<BusEvent>,
    connected_before: bool,
) -> StreamResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(topics).await?;
    pool.record_success();
    if connected_before {
        BUS_RECONNECTS.inc();
        if tx.send(BusEvent::Reconnected).is_err() {
            return Ok(());
        }
    }
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        pool.record_success();
        let topic = msg.get_channel_name().to_string();
        let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
        if tx.send(BusEvent::Message { topic, payload }).is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// No live Redis in unit scope; the integration test against a real container
    /// lives in `tests/redis_bus.rs`. This just locks down the health-window math.
    #[test]
    fn freshly_constructed_pool_reports_unhealthy() {
        let pool = ConnectionPool::new("redis://127.0.0.1:1").unwrap();
        assert!(!pool.is_healthy());
    }

    #[test]
    fn healthy_after_recording_success_then_degraded_after_five_failures() {
        let pool = ConnectionPool::new("redis://127.0.0.1:1").unwrap();
        pool.record_success();
        assert!(pool.is_healthy());

        for _ in 0..DEGRADED_AFTER_FAILURES {
            pool.record_failure();
        }
        assert!(!pool.is_healthy());
    }
}
