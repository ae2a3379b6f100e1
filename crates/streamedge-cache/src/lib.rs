//! In-memory pattern cache: keyed table plus three sorted
//! indexes, TTL eviction and an optional memory ceiling. The second-level,
//! TTL-keyed response micro-cache that sits in front of `scan()` lives in
//! `streamedge-query`, which reads [`PatternCache::generation`] to decide when its
//! own cached answers are stale rather than being told about every insert directly.

use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use prometheus::{IntGauge, register_int_gauge};
use streamedge_types::event::Tier;
use streamedge_types::pattern::{confidence_key, epoch_key};
use streamedge_types::{CachedPattern, Event};

static CACHE_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("streamedge_pattern_cache_size", "Number of cached patterns")
        .expect("metric registration never fails twice for the same name")
});

static CACHE_EVICTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "streamedge_pattern_cache_evictions_total",
        "Patterns evicted by TTL sweep or memory ceiling"
    )
    .expect("metric registration never fails twice for the same name")
});

type ConfidenceKey = (u32, String);
type DetectedAtKey = (i64, String);
type SymbolTimeKey = (String, i64, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortBy {
    Confidence,
    DetectedAt,
    Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Default, Clone)]
pub struct ScanFilter {
    pub symbols: Option<Vec<String>>,
    pub tiers: Option<Vec<Tier>>,
    pub pattern_names: Option<Vec<String>>,
    pub min_confidence: Option<f64>,
}

impl ScanFilter {
    fn admits(&self, pattern: &CachedPattern) -> bool {
        if let Some(symbols) = &self.symbols {
            if !symbols.iter().any(|s| s == &pattern.symbol) {
                return false;
            }
        }
        if let Some(tiers) = &self.tiers {
            if !tiers.contains(&pattern.tier) {
                return false;
            }
        }
        if let Some(names) = &self.pattern_names {
            if !names.iter().any(|n| n == &pattern.pattern_name) {
                return false;
            }
        }
        if let Some(min_confidence) = self.min_confidence {
            // inclusive bound: confidence == min_confidence matches
            if pattern.confidence < min_confidence {
                return false;
            }
        }
        true
    }
}

pub struct ScanOutcome {
    pub items: Vec<CachedPattern>,
    pub total: usize,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub count: usize,
    pub memory_estimate_bytes: usize,
}

struct Indexes {
    by_confidence: RwLock<BTreeSet<ConfidenceKey>>,
    by_detected_at: RwLock<BTreeSet<DetectedAtKey>>,
    by_symbol_time: RwLock<BTreeSet<SymbolTimeKey>>,
}

impl Indexes {
    fn new() -> Self {
        Self {
            by_confidence: RwLock::new(BTreeSet::new()),
            by_detected_at: RwLock::new(BTreeSet::new()),
            by_symbol_time: RwLock::new(BTreeSet::new()),
        }
    }

    fn insert(&self, pattern: &CachedPattern) {
        self.by_confidence
            .write()
            .insert((confidence_key(pattern.confidence), pattern.id.clone()));
        self.by_detected_at
            .write()
            .insert((epoch_key(pattern.detected_at), pattern.id.clone()));
        self.by_symbol_time.write().insert((
            pattern.symbol.clone(),
            epoch_key(pattern.detected_at),
            pattern.id.clone(),
        ));
    }

    fn remove(&self, pattern: &CachedPattern) {
        self.by_confidence
            .write()
            .remove(&(confidence_key(pattern.confidence), pattern.id.clone()));
        self.by_detected_at
            .write()
            .remove(&(epoch_key(pattern.detected_at), pattern.id.clone()));
        self.by_symbol_time.write().remove(&(
            pattern.symbol.clone(),
            epoch_key(pattern.detected_at),
            pattern.id.clone(),
        ));
    }
}

pub struct PatternCache {
    patterns: DashMap<String, CachedPattern>,
    indexes: Indexes,
    generation: AtomicU64,
    default_ttl_sec: i64,
    max_entries: usize,
}

impl PatternCache {
    pub fn new(default_ttl_sec: i64, max_entries: usize) -> Self {
        Self {
            patterns: DashMap::new(),
            indexes: Indexes::new(),
            generation: AtomicU64::new(0),
            default_ttl_sec,
            max_entries,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Idempotent insert: `insert(p); insert(p)` leaves the table and every derived
    /// index indistinguishable from a single insert (property law 1).
    pub fn insert(&self, pattern: CachedPattern) {
        if let Some(existing) = self.patterns.get(&pattern.id) {
            self.indexes.remove(&existing);
        }
        self.indexes.insert(&pattern);
        self.patterns.insert(pattern.id.clone(), pattern);
        CACHE_SIZE.set(self.patterns.len() as i64);
        self.bump_generation();
        self.enforce_memory_ceiling();
    }

    pub fn insert_event(&self, event: &Event) -> Option<()> {
        let pattern = CachedPattern::from_event(event, self.default_ttl_sec)?;
        self.insert(pattern);
        Some(())
    }

    pub fn remove(&self, id: &str) -> Option<CachedPattern> {
        let removed = self.patterns.remove(id).map(|(_, p)| p);
        if let Some(pattern) = &removed {
            self.indexes.remove(pattern);
            CACHE_SIZE.set(self.patterns.len() as i64);
            self.bump_generation();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<CachedPattern> {
        self.patterns.get(id).map(|r| r.value().clone())
    }

    pub fn clear_all(&self) {
        self.patterns.clear();
        *self.indexes.by_confidence.write() = BTreeSet::new();
        *self.indexes.by_detected_at.write() = BTreeSet::new();
        *self.indexes.by_symbol_time.write() = BTreeSet::new();
        CACHE_SIZE.set(0);
        self.bump_generation();
    }

    /// Periodic sweep evicting entries past `expires_at`. Index removal happens in
    /// the same pass as the table removal so no index ever points at a dead id.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .patterns
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        if !expired.is_empty() {
            CACHE_EVICTIONS.inc_by(expired.len() as u64);
            tracing::debug!(count = expired.len(), "swept expired cache entries");
        }
        expired.len()
    }

    /// When over `max_entries`, evicts the oldest-by-`detected_at` entries first.
    fn enforce_memory_ceiling(&self) {
        if self.max_entries == 0 {
            return;
        }
        while self.patterns.len() > self.max_entries {
            let oldest = self.indexes.by_detected_at.read().iter().next().cloned();
            match oldest {
                Some((_, id)) => {
                    self.remove(&id);
                    CACHE_EVICTIONS.inc();
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let count = self.patterns.len();
        CacheStats {
            count,
            // a rough per-entry estimate; exact accounting isn't worth the bookkeeping
            // at the cache sizes this pipeline targets.
            memory_estimate_bytes: count * 512,
        }
    }

    pub fn scan(
        &self,
        filter: &ScanFilter,
        sort_by: SortBy,
        sort_dir: SortDir,
        page: usize,
        per_page: usize,
    ) -> ScanOutcome {
        self.scan_with_deadline(filter, sort_by, sort_dir, page, per_page, None)
            .expect("scan without a deadline never times out")
    }

    /// As [`PatternCache::scan`], but aborts with `Err(())` if `deadline` elapses
    /// before the walk completes. Checked every 256 candidates rather than per
    /// candidate, since the clock read itself has a cost. The walk executes
    /// synchronously on the caller's thread and cannot be preempted externally.
    pub fn scan_with_deadline(
        &self,
        filter: &ScanFilter,
        sort_by: SortBy,
        sort_dir: SortDir,
        page: usize,
        per_page: usize,
        deadline: Option<(std::time::Instant, std::time::Duration)>,
    ) -> Result<ScanOutcome, ()> {
        const DEADLINE_CHECK_STRIDE: usize = 256;
        let started = std::time::Instant::now();
        let ids_in_order = self.ordered_ids(sort_by, sort_dir);

        let mut total = 0usize;
        let mut items = Vec::with_capacity(per_page.min(256));
        let skip = (page - 1) * per_page;
        let mut seen = 0usize;
        for (walked, id) in ids_in_order.into_iter().enumerate() {
            if let Some((start, budget)) = deadline {
                if walked % DEADLINE_CHECK_STRIDE == 0 && start.elapsed() > budget {
                    return Err(());
                }
            }
            let Some(pattern) = self.patterns.get(&id).map(|r| r.value().clone()) else {
                continue;
            };
            if !filter.admits(&pattern) {
                continue;
            }
            total += 1;
            if seen >= skip && items.len() < per_page {
                items.push(pattern);
            }
            seen += 1;
        }

        Ok(ScanOutcome {
            items,
            total,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn ordered_ids(&self, sort_by: SortBy, sort_dir: SortDir) -> Vec<String> {
        match sort_by {
            SortBy::Confidence => {
                let set = self.indexes.by_confidence.read();
                collect_ids(set.iter(), sort_dir, |(_, id)| id.clone())
            }
            SortBy::DetectedAt => {
                let set = self.indexes.by_detected_at.read();
                collect_ids(set.iter(), sort_dir, |(_, id)| id.clone())
            }
            SortBy::Symbol => {
                let set = self.indexes.by_symbol_time.read();
                collect_ids(set.iter(), sort_dir, |(_, _, id)| id.clone())
            }
        }
    }
}

fn collect_ids<'a, T: 'a>(
    iter: impl DoubleEndedIterator<Item = &'a T>,
    dir: SortDir,
    extract: impl Fn(&T) -> String,
) -> Vec<String> {
    match dir {
        SortDir::Asc => iter.map(extract).collect(),
        SortDir::Desc => iter.rev().map(extract).collect(),
    }
}

/// Spawns the single background task that sweeps expired entries out of the cache.
pub fn spawn_ttl_sweeper(
    cache: std::sync::Arc<PatternCache>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            cache.sweep_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn pattern(id: &str, symbol: &str, name: &str, confidence: f64, detected_at_ms: i64) -> CachedPattern {
        CachedPattern {
            id: id.into(),
            symbol: symbol.into(),
            pattern_name: name.into(),
            tier: Tier::Daily,
            confidence,
            detected_at: Utc.timestamp_millis_opt(detected_at_ms).unwrap(),
            expires_at: Utc.timestamp_millis_opt(detected_at_ms).unwrap() + Duration::hours(1),
            raw: Default::default(),
        }
    }

    #[test]
    fn insert_and_range_scan() {
        let cache = PatternCache::new(3600, 0);
        cache.insert(pattern("p1", "AAPL", "Doji", 0.90, 1000));
        cache.insert(pattern("p2", "MSFT", "Hammer", 0.70, 1100));
        cache.insert(pattern("p3", "AAPL", "Doji", 0.82, 1200));

        let outcome = cache.scan(
            &ScanFilter {
                min_confidence: Some(0.8),
                ..Default::default()
            },
            SortBy::Confidence,
            SortDir::Desc,
            1,
            10,
        );

        assert_eq!(outcome.total, 2);
        let ids: Vec<&str> = outcome.items.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[test]
    fn idempotent_insert_leaves_single_entry_in_every_index() {
        let cache = PatternCache::new(3600, 0);
        let p = pattern("p1", "AAPL", "Doji", 0.9, 1000);
        cache.insert(p.clone());
        cache.insert(p.clone());

        assert_eq!(cache.stats().count, 1);
        assert_eq!(cache.indexes.by_confidence.read().len(), 1);
        assert_eq!(cache.indexes.by_detected_at.read().len(), 1);
        assert_eq!(cache.indexes.by_symbol_time.read().len(), 1);
    }

    #[test]
    fn reinsert_with_changed_confidence_updates_index_in_place() {
        let cache = PatternCache::new(3600, 0);
        cache.insert(pattern("p1", "AAPL", "Doji", 0.5, 1000));
        cache.insert(pattern("p1", "AAPL", "Doji", 0.95, 1000));

        let outcome = cache.scan(&ScanFilter::default(), SortBy::Confidence, SortDir::Desc, 1, 10);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].confidence, 0.95);
        assert_eq!(cache.indexes.by_confidence.read().len(), 1);
    }

    #[test]
    fn expired_entries_are_absent_from_all_indexes_after_sweep() {
        let cache = PatternCache::new(3600, 0);
        let mut p = pattern("p1", "AAPL", "Doji", 0.9, 1000);
        p.expires_at = Utc::now() - Duration::seconds(1);
        cache.insert(p);

        let swept = cache.sweep_expired();
        assert_eq!(swept, 1);
        assert!(cache.get("p1").is_none());
        assert!(cache.indexes.by_confidence.read().is_empty());
        assert!(cache.indexes.by_detected_at.read().is_empty());
        assert!(cache.indexes.by_symbol_time.read().is_empty());
    }

    #[test]
    fn memory_ceiling_evicts_oldest_by_detected_at() {
        let cache = PatternCache::new(3600, 2);
        cache.insert(pattern("p1", "AAPL", "Doji", 0.9, 1000));
        cache.insert(pattern("p2", "MSFT", "Hammer", 0.8, 2000));
        cache.insert(pattern("p3", "NVDA", "Doji", 0.7, 3000));

        assert_eq!(cache.stats().count, 2);
        assert!(cache.get("p1").is_none());
        assert!(cache.get("p2").is_some());
        assert!(cache.get("p3").is_some());
    }

    #[test]
    fn per_page_boundary_returns_empty_page_past_total() {
        let cache = PatternCache::new(3600, 0);
        cache.insert(pattern("p1", "AAPL", "Doji", 0.9, 1000));

        let outcome = cache.scan(&ScanFilter::default(), SortBy::DetectedAt, SortDir::Asc, 2, 10);
        assert_eq!(outcome.total, 1);
        assert!(outcome.items.is_empty());
    }
}
