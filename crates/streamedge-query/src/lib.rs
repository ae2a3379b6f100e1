//! Query service: the synchronous read surface a host HTTP layer
//! would call into, `scan`/`get_by_id`/`stats`/`summary`/`health`, plus the
//! response micro-cache that sits in front of `scan`.
//!
//! This crate holds only the pure query logic; binding it to an HTTP handler is an
//! explicit out-of-scope collaborator.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use streamedge_broadcaster::Broadcaster;
use streamedge_bus::ConnectionPool;
use streamedge_cache::{PatternCache, ScanFilter, SortBy, SortDir};
use streamedge_subindex::SubscriptionIndex;
use streamedge_types::event::Tier;
use streamedge_types::{CachedPattern, ComponentHealth, HealthReport, PipelineStats, StreamError, Status};

pub use streamedge_cache::{SortBy as ScanSortBy, SortDir as ScanSortDir};

const RESPONSE_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub symbols: Option<Vec<String>>,
    pub tiers: Option<Vec<Tier>>,
    pub pattern_names: Option<Vec<String>>,
    pub min_confidence: Option<f64>,
    pub sort_by: Option<ScanSortBy>,
    pub sort_dir: Option<ScanSortDir>,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    CacheMiss,
}

#[derive(Debug, Clone)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct ScanResponse {
    pub items: Vec<CachedPattern>,
    pub pagination: Pagination,
    pub took_ms: u64,
    pub source: Source,
}

#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub events_processed: u64,
    pub last_event_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SummarySnapshot {
    pub top_pattern_names: Vec<(String, usize)>,
    pub top_symbols: Vec<(String, usize)>,
    pub counts_by_tier: HashMap<Tier, usize>,
    pub hit_ratio: f64,
}

struct CachedAnswer {
    response: ScanResponse,
    cached_at: Instant,
    generation: u64,
}

struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, CachedAnswer>>,
    order: Mutex<std::collections::VecDeque<u64>>,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            order: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    fn get(&self, key: u64, current_generation: u64) -> Option<ScanResponse> {
        let entries = self.entries.lock();
        let answer = entries.get(&key)?;
        if answer.generation != current_generation || answer.cached_at.elapsed() > self.ttl {
            return None;
        }
        Some(answer.response.clone())
    }

    fn put(&self, key: u64, response: ScanResponse, generation: u64) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) {
            let mut order = self.order.lock();
            order.push_back(key);
            if order.len() > RESPONSE_CACHE_CAPACITY {
                if let Some(oldest) = order.pop_front() {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CachedAnswer {
                response,
                cached_at: Instant::now(),
                generation,
            },
        );
    }
}

impl Clone for ScanResponse {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            pagination: self.pagination.clone(),
            took_ms: self.took_ms,
            source: self.source,
        }
    }
}

pub struct QueryServiceConfig {
    pub response_cache_ttl: Duration,
    pub query_deadline: Duration,
}

impl Default for QueryServiceConfig {
    fn default() -> Self {
        Self {
            response_cache_ttl: Duration::from_secs(30),
            query_deadline: Duration::from_secs(1),
        }
    }
}

pub struct QueryService {
    cache: Arc<PatternCache>,
    bus: Arc<ConnectionPool>,
    index: Arc<SubscriptionIndex>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<PipelineStats>,
    response_cache: ResponseCache,
    query_deadline: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryService {
    pub fn new(
        cache: Arc<PatternCache>,
        bus: Arc<ConnectionPool>,
        index: Arc<SubscriptionIndex>,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<PipelineStats>,
        config: QueryServiceConfig,
    ) -> Self {
        Self {
            cache,
            bus,
            index,
            broadcaster,
            stats,
            response_cache: ResponseCache::new(config.response_cache_ttl),
            query_deadline: config.query_deadline,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn scan(&self, request: ScanRequest) -> Result<ScanResponse, StreamError> {
        if request.page == 0 {
            return Err(StreamError::Validation {
                field: Some("page".into()),
                message: "page must be >= 1".into(),
            });
        }
        if request.per_page == 0 {
            return Err(StreamError::Validation {
                field: Some("per_page".into()),
                message: "per_page must be >= 1".into(),
            });
        }
        // per_page > 100 is clamped rather than rejected.
        let per_page = request.per_page.min(100);

        let key = hash_request(&request, per_page);
        let generation = self.cache.generation();
        if let Some(cached) = self.response_cache.get(key, generation) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(ScanResponse {
                source: Source::Cache,
                ..cached
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let filter = ScanFilter {
            symbols: request.symbols.clone(),
            tiers: request.tiers.clone(),
            pattern_names: request.pattern_names.clone(),
            min_confidence: request.min_confidence,
        };
        let sort_by = request.sort_by.unwrap_or(SortBy::DetectedAt);
        let sort_dir = request.sort_dir.unwrap_or(SortDir::Desc);

        let started = Instant::now();
        let outcome = self
            .cache
            .scan_with_deadline(
                &filter,
                sort_by,
                sort_dir,
                request.page,
                per_page,
                Some((started, self.query_deadline)),
            )
            .map_err(|()| StreamError::QueryTimeout)?;

        let pages = outcome.total.div_ceil(per_page).max(1);
        let response = ScanResponse {
            items: outcome.items,
            pagination: Pagination {
                page: request.page,
                per_page,
                total: outcome.total,
                pages,
            },
            took_ms: outcome.took_ms,
            source: Source::CacheMiss,
        };

        self.response_cache.put(key, response.clone(), generation);
        Ok(response)
    }

    pub fn get_by_id(&self, id: &str) -> Option<CachedPattern> {
        self.cache.get(id)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_ratio = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
        StatsSnapshot {
            cached: self.cache.stats().count,
            hits,
            misses,
            hit_ratio,
            events_processed: self.stats.events_processed(),
            last_event_ts: self.stats.last_event_ts(),
        }
    }

    /// Aggregated distributions over the currently cached patterns. Scans the whole
    /// table rather than maintaining live counters, acceptable at the sizes this
    /// pipeline targets (spec: N <= 10,000 cached patterns).
    pub fn summary(&self) -> SummarySnapshot {
        let all = self.cache.scan(&ScanFilter::default(), SortBy::DetectedAt, SortDir::Desc, 1, usize::MAX);

        let mut by_pattern_name: HashMap<String, usize> = HashMap::new();
        let mut by_symbol: HashMap<String, usize> = HashMap::new();
        let mut by_tier: HashMap<Tier, usize> = HashMap::new();
        for pattern in &all.items {
            *by_pattern_name.entry(pattern.pattern_name.clone()).or_default() += 1;
            *by_symbol.entry(pattern.symbol.clone()).or_default() += 1;
            *by_tier.entry(pattern.tier).or_default() += 1;
        }

        let mut top_pattern_names: Vec<(String, usize)> = by_pattern_name.into_iter().collect();
        top_pattern_names.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_pattern_names.truncate(10);

        let mut top_symbols: Vec<(String, usize)> = by_symbol.into_iter().collect();
        top_symbols.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_symbols.truncate(10);

        let stats = self.stats();
        SummarySnapshot {
            top_pattern_names,
            top_symbols,
            counts_by_tier: by_tier,
            hit_ratio: stats.hit_ratio,
        }
    }

    /// Overall health is `degraded` if any component is unhealthy,
    /// `unhealthy` only if the bus connection is down (the subscriber's health is
    /// inseparable from the bus's: it has no liveness signal of its own beyond the
    /// connection it reads from).
    pub fn health(&self) -> HealthReport {
        let components = vec![
            ComponentHealth {
                name: "bus".into(),
                status: status_of(self.bus.is_healthy()),
                detail: None,
            },
            ComponentHealth {
                name: "broadcaster".into(),
                status: status_of(self.broadcaster.healthy()),
                detail: Some(format!("{} connected clients", self.broadcaster.connected_clients())),
            },
            ComponentHealth {
                name: "subscription_index".into(),
                status: Status::Healthy,
                detail: Some(format!("{} subscriptions", self.index.len())),
            },
            ComponentHealth {
                name: "pattern_cache".into(),
                status: Status::Healthy,
                detail: Some(format!("{} cached patterns", self.cache.stats().count)),
            },
        ];
        HealthReport::aggregate(components, &["bus"])
    }
}

fn status_of(healthy: bool) -> Status {
    if healthy { Status::Healthy } else { Status::Unhealthy }
}

fn hash_request(request: &ScanRequest, per_page: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    request.symbols.hash(&mut hasher);
    request.tiers.hash(&mut hasher);
    request.pattern_names.hash(&mut hasher);
    request.min_confidence.map(|c| (c * 1_000_000.0) as i64).hash(&mut hasher);
    request.sort_by.hash(&mut hasher);
    request.sort_dir.hash(&mut hasher);
    request.page.hash(&mut hasher);
    per_page.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn make_service() -> (Arc<PatternCache>, QueryService) {
        let cache = Arc::new(PatternCache::new(3600, 0));
        let bus = Arc::new(ConnectionPool::new("redis://127.0.0.1:1").unwrap());
        let index = Arc::new(SubscriptionIndex::new());
        let broadcaster = Broadcaster::new(index.clone(), Default::default());
        let stats = Arc::new(PipelineStats::default());
        let service = QueryService::new(
            cache.clone(),
            bus,
            index,
            broadcaster,
            stats,
            QueryServiceConfig::default(),
        );
        (cache, service)
    }

    fn pattern(id: &str, symbol: &str, confidence: f64, detected_at_ms: i64) -> CachedPattern {
        CachedPattern {
            id: id.into(),
            symbol: symbol.into(),
            pattern_name: "Doji".into(),
            tier: Tier::Daily,
            confidence,
            detected_at: Utc.timestamp_millis_opt(detected_at_ms).unwrap(),
            expires_at: Utc.timestamp_millis_opt(detected_at_ms).unwrap() + ChronoDuration::hours(1),
            raw: Default::default(),
        }
    }

    #[test]
    fn page_zero_is_a_validation_error() {
        let (_cache, service) = make_service();
        let result = service.scan(ScanRequest {
            page: 0,
            per_page: 10,
            ..Default::default()
        });
        assert!(matches!(result, Err(StreamError::Validation { .. })));
    }

    #[test]
    fn per_page_zero_is_a_validation_error() {
        let (_cache, service) = make_service();
        let result = service.scan(ScanRequest {
            page: 1,
            per_page: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(StreamError::Validation { .. })));
    }

    #[test]
    fn per_page_above_100_is_clamped() {
        let (_cache, service) = make_service();
        let response = service
            .scan(ScanRequest {
                page: 1,
                per_page: 500,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(response.pagination.per_page, 100);
    }

    #[test]
    fn repeated_identical_scan_is_served_from_response_cache() {
        let (cache, service) = make_service();
        cache.insert(pattern("p1", "AAPL", 0.9, 1000));

        let request = ScanRequest {
            page: 1,
            per_page: 10,
            ..Default::default()
        };
        let first = service.scan(request.clone()).unwrap();
        assert_eq!(first.source, Source::CacheMiss);
        let second = service.scan(request).unwrap();
        assert_eq!(second.source, Source::Cache);
        assert_eq!(second.items.len(), 1);
    }

    #[test]
    fn insert_invalidates_the_response_cache_via_generation() {
        let (cache, service) = make_service();
        let request = ScanRequest {
            page: 1,
            per_page: 10,
            ..Default::default()
        };
        let first = service.scan(request.clone()).unwrap();
        assert_eq!(first.total_items(), 0);

        cache.insert(pattern("p1", "AAPL", 0.9, 1000));
        let second = service.scan(request).unwrap();
        assert_eq!(second.source, Source::CacheMiss);
        assert_eq!(second.items.len(), 1);
    }

    impl ScanResponse {
        fn total_items(&self) -> usize {
            self.items.len()
        }
    }
}
