use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, Scalar, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPattern {
    pub id: String,
    pub symbol: String,
    pub pattern_name: String,
    pub tier: Tier,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub raw: HashMap<String, Scalar>,
}

impl CachedPattern {
    /// Builds a cache entry from a decoded event, deriving `expires_at` from
    /// `pattern_ttl_sec` when the upstream payload did not carry one.
    pub fn from_event(event: &Event, default_ttl_sec: i64) -> Option<Self> {
        match event {
            Event::PatternDetected {
                id,
                symbol,
                pattern_name,
                tier,
                confidence,
                detected_at,
                expires_at,
                attributes,
            } => Some(CachedPattern {
                id: id.clone(),
                symbol: symbol.clone(),
                pattern_name: pattern_name.clone(),
                tier: *tier,
                confidence: *confidence,
                detected_at: *detected_at,
                expires_at: expires_at
                    .unwrap_or_else(|| *detected_at + chrono::Duration::seconds(default_ttl_sec)),
                raw: attributes.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Quantizes a confidence value in `[0, 1]` into an integer sort key so it can live as
/// a `BTreeMap` key without pulling in a third-party `Ord`-for-`f64` wrapper.
pub fn confidence_key(confidence: f64) -> u32 {
    (confidence.clamp(0.0, 1.0) * 1_000_000.0).round() as u32
}

/// Inverse of [`confidence_key`], used by index-compound keys whose sort direction is
/// descending (stored ascending internally, walked in reverse).
pub fn epoch_key(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_key_preserves_ordering() {
        assert!(confidence_key(0.70) < confidence_key(0.82));
        assert!(confidence_key(0.82) < confidence_key(0.90));
    }

    #[test]
    fn confidence_key_clamps_out_of_range_values() {
        assert_eq!(confidence_key(-1.0), confidence_key(0.0));
        assert_eq!(confidence_key(2.0), confidence_key(1.0));
    }
}
