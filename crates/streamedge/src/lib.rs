//! Fail-fast process orchestrator: builds every pipeline component in dependency
//! order, spawns their background tasks, and exposes a single [`Orchestrator`] handle
//! the binary entry point uses for health reporting and graceful shutdown.
//!
//! The query surface is handed back to the caller unbound to any transport. Binding
//! it to an HTTP router or socket layer is an explicit out-of-scope collaborator, not
//! this crate's concern.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use streamedge_broadcaster::{Broadcaster, BroadcasterConfig, BroadcasterSink};
use streamedge_buffer::StreamingBuffer;
use streamedge_bus::ConnectionPool;
use streamedge_cache::PatternCache;
use streamedge_cli::CliArgs;
use streamedge_query::{QueryService, QueryServiceConfig};
use streamedge_subindex::SubscriptionIndex;
use streamedge_subscriber::EventSubscriber;
use streamedge_types::{HealthReport, PipelineStats};
use tokio::task::JoinHandle;
use tracing::info;

const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const INDEX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BROADCASTER_SHARD_COUNT: usize = 4;

/// Owns every long-running background task. Dropping this without calling
/// [`Orchestrator::shutdown`] aborts the tasks immediately; `shutdown` lets the
/// buffer drain first.
pub struct Orchestrator {
    pub bus: Arc<ConnectionPool>,
    pub cache: Arc<PatternCache>,
    pub index: Arc<SubscriptionIndex>,
    pub broadcaster: Arc<Broadcaster>,
    pub buffer: Arc<StreamingBuffer>,
    pub query: Arc<QueryService>,
    ttl_sweeper: JoinHandle<()>,
    index_sweeper: JoinHandle<()>,
    flush_task: JoinHandle<()>,
    subscriber_task: JoinHandle<()>,
}

impl Orchestrator {
    pub fn builder(args: CliArgs) -> OrchestratorBuilder {
        OrchestratorBuilder { args }
    }

    pub fn health(&self) -> HealthReport {
        self.query.health()
    }

    /// Reverse-order shutdown: stop taking new subscriber work, run one last buffer
    /// flush so nothing queued is silently dropped, then tear down the remaining
    /// background tasks. The bus and broadcaster hold no resources that outlive the
    /// process beyond what dropping their `Arc`s already releases.
    pub async fn shutdown(self) {
        self.subscriber_task.abort();
        self.buffer.flush();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.flush_task.abort();
        self.index_sweeper.abort();
        self.ttl_sweeper.abort();
        info!("orchestrator shutdown complete");
    }
}

pub struct OrchestratorBuilder {
    args: CliArgs,
}

impl OrchestratorBuilder {
    /// Builds every component in the order each depends on the last, aborting with
    /// context on the first failure: bus, cache, subscription index, broadcaster
    /// (needs the index), streaming buffer (needs the broadcaster as its flush
    /// sink), event subscriber, query service.
    pub async fn build(self) -> Result<Orchestrator> {
        let args = self.args;

        let bus = Arc::new(build_bus(&args)?);
        info!("bus connection pool initialized");

        let cache = Arc::new(PatternCache::new(args.cache.pattern_ttl_sec, 0));
        info!("pattern cache initialized");

        let index = Arc::new(SubscriptionIndex::new());
        info!("subscription index initialized");

        let broadcaster = Broadcaster::new(
            Arc::clone(&index),
            BroadcasterConfig {
                shard_count: BROADCASTER_SHARD_COUNT,
                rate_limit_per_sec: args.rate.rate_limit_events_per_sec,
                per_send_deadline: Duration::from_millis(args.deadline.per_send_deadline_ms),
            },
        );
        info!("broadcaster initialized");

        let sink: Arc<dyn streamedge_buffer::BufferSink> =
            Arc::new(BroadcasterSink(Arc::clone(&broadcaster)));
        let buffer = Arc::new(StreamingBuffer::new(args.buffer.buffer_max_size, sink));
        info!("streaming buffer initialized");

        let stats = Arc::new(PipelineStats::default());

        let subscriber = EventSubscriber::new(
            Arc::clone(&bus),
            Arc::clone(&cache),
            Arc::clone(&buffer),
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
        );
        info!("event subscriber initialized");

        let query = Arc::new(QueryService::new(
            Arc::clone(&cache),
            Arc::clone(&bus),
            Arc::clone(&index),
            Arc::clone(&broadcaster),
            Arc::clone(&stats),
            QueryServiceConfig {
                response_cache_ttl: Duration::from_secs(args.cache.response_cache_ttl_sec),
                query_deadline: Duration::from_millis(args.deadline.query_deadline_ms),
            },
        ));
        info!("query service initialized");

        let ttl_sweeper = streamedge_cache::spawn_ttl_sweeper(Arc::clone(&cache), TTL_SWEEP_INTERVAL);
        let index_sweeper = streamedge_subindex::spawn_stale_sweeper(
            Arc::clone(&index),
            chrono::Duration::seconds(args.cache.index_ttl_sec as i64),
            INDEX_SWEEP_INTERVAL,
        );
        let flush_task = streamedge_buffer::spawn_flush_task(
            Arc::clone(&buffer),
            Duration::from_millis(args.buffer.buffer_interval_ms),
        );
        let subscriber_task = tokio::spawn(subscriber.run());

        Ok(Orchestrator {
            bus,
            cache,
            index,
            broadcaster,
            buffer,
            query,
            ttl_sweeper,
            index_sweeper,
            flush_task,
            subscriber_task,
        })
    }
}

fn build_bus(args: &CliArgs) -> Result<ConnectionPool> {
    if args.bus.is_cluster() {
        return ConnectionPool::new_with_cluster(args.bus.bus_address.clone())
            .context("initializing bus: redis cluster client");
    }
    let url = args
        .bus
        .connection_url()
        .ok_or_else(|| anyhow!("bus_address is required"))?;
    ConnectionPool::new(&url).context("initializing bus: redis client")
}
