//! Subscription-indexed reverse lookup.
//!
//! `match(event)` must never observe a partial cross-dimension update, so the whole
//! set of dimension maps is published as a single immutable [`IndexSnapshot`] behind
//! an [`ArcSwap`]. Writers (`subscribe`/`unsubscribe`) serialize through a
//! `parking_lot::Mutex` guarding the source-of-truth subscription table, build the
//! next snapshot from it, then swap the pointer in one atomic store. Readers always
//! see either the old snapshot or the new one in full.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use streamedge_types::event::{Event, EventKind, Tier};
use streamedge_types::subscription::Subscription;

#[derive(Default)]
struct IndexSnapshot {
    by_kind: HashMap<EventKind, HashSet<String>>,
    by_symbol: HashMap<String, HashSet<String>>,
    by_tier: HashMap<Tier, HashSet<String>>,
    by_pattern_name: HashMap<String, HashSet<String>>,
    wildcard_symbol: HashSet<String>,
    wildcard_tier: HashSet<String>,
    wildcard_pattern_name: HashSet<String>,
    subscriptions: HashMap<String, Subscription>,
}

impl IndexSnapshot {
    fn rebuild_from(subscriptions: &HashMap<String, Subscription>) -> Self {
        let mut snapshot = IndexSnapshot {
            subscriptions: subscriptions.clone(),
            ..Default::default()
        };
        for (client_id, sub) in subscriptions {
            for kind in &sub.predicate.kinds {
                snapshot
                    .by_kind
                    .entry(*kind)
                    .or_default()
                    .insert(client_id.clone());
            }
            match &sub.predicate.symbols {
                Some(symbols) => {
                    for symbol in symbols {
                        snapshot
                            .by_symbol
                            .entry(symbol.clone())
                            .or_default()
                            .insert(client_id.clone());
                    }
                }
                None => {
                    snapshot.wildcard_symbol.insert(client_id.clone());
                }
            }
            match &sub.predicate.tiers {
                Some(tiers) => {
                    for tier in tiers {
                        snapshot
                            .by_tier
                            .entry(*tier)
                            .or_default()
                            .insert(client_id.clone());
                    }
                }
                None => {
                    snapshot.wildcard_tier.insert(client_id.clone());
                }
            }
            match &sub.predicate.pattern_names {
                Some(names) => {
                    for name in names {
                        snapshot
                            .by_pattern_name
                            .entry(name.clone())
                            .or_default()
                            .insert(client_id.clone());
                    }
                }
                None => {
                    snapshot.wildcard_pattern_name.insert(client_id.clone());
                }
            }
        }
        snapshot
    }
}

pub struct SubscriptionIndex {
    snapshot: ArcSwap<IndexSnapshot>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(IndexSnapshot::default()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Installs or replaces a client's subscription. A re-subscribe for an existing
    /// `client_id` fully overwrites the previous predicate and resets its TTL clock.
    pub fn subscribe(&self, client_id: String, predicate: streamedge_types::Predicate) {
        let mut table = self.subscriptions.lock();
        table.insert(
            client_id.clone(),
            Subscription {
                client_id,
                predicate,
                renewed_at: chrono::Utc::now(),
            },
        );
        self.publish(&table);
    }

    pub fn unsubscribe(&self, client_id: &str) {
        let mut table = self.subscriptions.lock();
        if table.remove(client_id).is_some() {
            self.publish(&table);
        }
    }

    /// Removes subscriptions whose last `subscribe()` call is older than `ttl`.
    /// A client that's still connected is expected to renew (re-subscribe) well
    /// within `ttl`; this only reclaims entries left behind by an ungraceful
    /// disconnect that never reached `unsubscribe`.
    pub fn sweep_stale(&self, ttl: chrono::Duration) -> usize {
        let now = chrono::Utc::now();
        let mut table = self.subscriptions.lock();
        let before = table.len();
        table.retain(|_, sub| now - sub.renewed_at < ttl);
        let removed = before - table.len();
        if removed > 0 {
            self.publish(&table);
        }
        removed
    }

    fn publish(&self, table: &HashMap<String, Subscription>) {
        self.snapshot
            .store(Arc::new(IndexSnapshot::rebuild_from(table)));
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the set of client ids whose predicate admits `event`, by intersecting
    /// per-dimension candidate sets (kind, symbol, min confidence, tier).
    pub fn matching_clients(&self, event: &Event) -> HashSet<String> {
        let snapshot = self.snapshot.load();

        let kind_candidates = snapshot
            .by_kind
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        if kind_candidates.is_empty() {
            return HashSet::new();
        }

        let symbol_candidates = dimension_candidates_str(
            event.symbol(),
            &snapshot.by_symbol,
            &snapshot.wildcard_symbol,
        );
        let tier = event.tier();
        let tier_candidates =
            dimension_candidates(tier.as_ref(), &snapshot.by_tier, &snapshot.wildcard_tier);
        let pattern_name_candidates = dimension_candidates_str(
            event.pattern_name(),
            &snapshot.by_pattern_name,
            &snapshot.wildcard_pattern_name,
        );

        // Smallest-set-first intersection, tie-broken by dimension priority
        // kind > symbol > tier > pattern_name.
        let mut sets = vec![
            (0u8, kind_candidates),
            (1u8, symbol_candidates),
            (2u8, tier_candidates),
            (3u8, pattern_name_candidates),
        ];
        sets.sort_by_key(|(priority, set)| (set.len(), *priority));

        let mut iter = sets.into_iter().map(|(_, set)| set);
        let mut result = match iter.next() {
            Some(first) => first,
            None => return HashSet::new(),
        };
        for set in iter {
            if result.is_empty() {
                break;
            }
            result.retain(|client_id| set.contains(client_id));
        }

        result.retain(|client_id| {
            snapshot
                .subscriptions
                .get(client_id)
                .is_some_and(|sub| admits_residual_predicates(&sub.predicate, event))
        });

        result
    }
}

/// Spawns the single background task that reclaims subscription-index entries a
/// client never renewed within `ttl` (an ungraceful disconnect, typically).
pub fn spawn_stale_sweeper(
    index: Arc<SubscriptionIndex>,
    ttl: chrono::Duration,
    sweep_every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            let removed = index.sweep_stale(ttl);
            if removed > 0 {
                tracing::debug!(removed, "swept stale subscription-index entries");
            }
        }
    })
}

/// Builds the candidate set for a dimension: if the event carries no value on this
/// dimension, only wildcard subscribers match; otherwise it's the union of exact
/// matches and wildcard subscribers.
fn dimension_candidates<K: std::hash::Hash + Eq>(
    value: Option<&K>,
    by_value: &HashMap<K, HashSet<String>>,
    wildcard: &HashSet<String>,
) -> HashSet<String> {
    match value {
        Some(v) => by_value
            .get(v)
            .map(|set| set.union(wildcard).cloned().collect())
            .unwrap_or_else(|| wildcard.clone()),
        None => wildcard.clone(),
    }
}

fn dimension_candidates_str(
    value: Option<&str>,
    by_value: &HashMap<String, HashSet<String>>,
    wildcard: &HashSet<String>,
) -> HashSet<String> {
    dimension_candidates(value.map(|s| s.to_string()).as_ref(), by_value, wildcard)
}

/// Scalar predicates (currently just `min_confidence`) aren't expressed as index
/// dimensions; they're checked once per surviving candidate.
fn admits_residual_predicates(predicate: &streamedge_types::Predicate, event: &Event) -> bool {
    if let Some(min_confidence) = predicate.min_confidence {
        match event.confidence() {
            Some(confidence) => confidence >= min_confidence,
            None => false,
        }
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet as Set;
    use streamedge_types::event::LifecycleKind;
    use streamedge_types::Predicate;

    fn pattern_event(symbol: &str, tier: Tier, confidence: f64) -> Event {
        Event::PatternDetected {
            id: "p1".into(),
            symbol: symbol.into(),
            pattern_name: "Doji".into(),
            tier,
            confidence,
            detected_at: Utc::now(),
            expires_at: None,
            attributes: Default::default(),
        }
    }

    #[test]
    fn subscription_match_by_predicate() {
        let index = SubscriptionIndex::new();
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                symbols: Some(Set::from(["AAPL".to_string(), "MSFT".to_string()])),
                min_confidence: Some(0.75),
                ..Default::default()
            },
        );
        index.subscribe(
            "c2".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                symbols: None,
                tiers: Some(Set::from([Tier::Daily])),
                ..Default::default()
            },
        );

        let matched = index.matching_clients(&pattern_event("AAPL", Tier::Daily, 0.80));
        assert_eq!(matched, Set::from(["c1".to_string(), "c2".to_string()]));

        let matched = index.matching_clients(&pattern_event("GOOG", Tier::Daily, 0.80));
        assert_eq!(matched, Set::from(["c2".to_string()]));

        let matched = index.matching_clients(&pattern_event("AAPL", Tier::Intraday, 0.60));
        assert!(matched.is_empty());
    }

    #[test]
    fn unsubscribe_removes_client_from_all_dimensions() {
        let index = SubscriptionIndex::new();
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                ..Default::default()
            },
        );
        assert_eq!(index.len(), 1);
        index.unsubscribe("c1");
        assert_eq!(index.len(), 0);
        let matched = index.matching_clients(&pattern_event("AAPL", Tier::Daily, 0.9));
        assert!(matched.is_empty());
    }

    #[test]
    fn resubscribe_overwrites_previous_predicate() {
        let index = SubscriptionIndex::new();
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                symbols: Some(Set::from(["AAPL".to_string()])),
                ..Default::default()
            },
        );
        index.subscribe(
            "c1".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                symbols: Some(Set::from(["MSFT".to_string()])),
                ..Default::default()
            },
        );
        assert!(index
            .matching_clients(&pattern_event("AAPL", Tier::Daily, 0.9))
            .is_empty());
        assert!(!index
            .matching_clients(&pattern_event("MSFT", Tier::Daily, 0.9))
            .is_empty());
    }

    /// Property law 3: subscription-index coherence, checked against `Predicate::admits`.
    #[test]
    fn coherence_matches_predicate_admits() {
        let index = SubscriptionIndex::new();
        let predicate = Predicate {
            kinds: Set::from([EventKind::Pattern]),
            symbols: Some(Set::from(["AAPL".to_string()])),
            tiers: None,
            pattern_names: None,
            min_confidence: Some(0.5),
        };
        index.subscribe("c1".into(), predicate.clone());

        for (symbol, tier, confidence) in [
            ("AAPL", Tier::Daily, 0.9),
            ("AAPL", Tier::Intraday, 0.1),
            ("MSFT", Tier::Daily, 0.9),
        ] {
            let event = pattern_event(symbol, tier, confidence);
            let matched = index.matching_clients(&event).contains("c1");
            assert_eq!(matched, predicate.admits(&event));
        }
    }

    #[test]
    fn non_scoped_events_only_match_wildcard_clients() {
        let index = SubscriptionIndex::new();
        index.subscribe(
            "scoped".into(),
            Predicate {
                kinds: Set::from([EventKind::Lifecycle]),
                symbols: Some(Set::from(["AAPL".to_string()])),
                ..Default::default()
            },
        );
        index.subscribe(
            "wildcard".into(),
            Predicate {
                kinds: Set::from([EventKind::Lifecycle]),
                ..Default::default()
            },
        );

        let event = Event::SessionLifecycle {
            kind: LifecycleKind::Started,
            session_id: "s1".into(),
            ts: Utc::now(),
        };
        let matched = index.matching_clients(&event);
        assert_eq!(matched, Set::from(["wildcard".to_string()]));
    }

    #[test]
    fn sweep_stale_removes_only_entries_past_ttl() {
        let index = SubscriptionIndex::new();
        index.subscribe(
            "stale".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                ..Default::default()
            },
        );
        {
            let mut table = index.subscriptions.lock();
            let sub = table.get_mut("stale").unwrap();
            sub.renewed_at = Utc::now() - chrono::Duration::hours(2);
        }
        index.subscribe(
            "fresh".into(),
            Predicate {
                kinds: Set::from([EventKind::Pattern]),
                ..Default::default()
            },
        );

        let removed = index.sweep_stale(chrono::Duration::hours(1));
        assert_eq!(removed, 1);
        assert_eq!(index.len(), 1);
        assert!(
            index
                .matching_clients(&pattern_event("AAPL", Tier::Daily, 0.9))
                .contains("fresh")
        );
    }
}
