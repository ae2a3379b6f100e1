use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventKind, Tier};

/// A client's declared interest. `None` on a `Some`-able dimension means "wildcard":
/// the client admits every value on that dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Predicate {
    pub kinds: HashSet<EventKind>,
    pub symbols: Option<HashSet<String>>,
    pub tiers: Option<HashSet<Tier>>,
    pub pattern_names: Option<HashSet<String>>,
    pub min_confidence: Option<f64>,
}

impl Predicate {
    /// Reference semantics for subscription-index coherence (property law 3): an
    /// event is admitted iff every populated dimension matches. Used directly by
    /// tests and as the ground truth the index's `match` algorithm must agree with.
    pub fn admits(&self, event: &Event) -> bool {
        if !self.kinds.contains(&event.kind()) {
            return false;
        }
        if let Some(symbols) = &self.symbols {
            match event.symbol() {
                Some(symbol) if symbols.contains(symbol) => {}
                _ => return false,
            }
        }
        if let Some(tiers) = &self.tiers {
            match event.tier() {
                Some(tier) if tiers.contains(&tier) => {}
                _ => return false,
            }
        }
        if let Some(pattern_names) = &self.pattern_names {
            match event.pattern_name() {
                Some(name) if pattern_names.contains(name) => {}
                _ => return false,
            }
        }
        if let Some(min_confidence) = self.min_confidence {
            match event.confidence() {
                // inclusive bound: confidence exactly at min_confidence is admitted
                Some(confidence) if confidence >= min_confidence => {}
                _ => return false,
            }
        }
        true
    }
}

/// `renewed_at` tracks the last `subscribe()` call for this client, independent of
/// the predicate it carries. It backs the subscription index's own stale-entry TTL
/// sweep, which is orthogonal to the pattern cache's TTL on cached detections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub predicate: Predicate,
    pub renewed_at: DateTime<Utc>,
}
