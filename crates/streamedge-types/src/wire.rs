use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Tier;
use crate::pattern::CachedPattern;
use crate::subscription::Predicate;

/// The `detection` payload shape clients see on `streaming_pattern` (single) and
/// inside `streaming_patterns_batch.patterns[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub pattern_name: String,
    pub symbol: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub tier: Tier,
}

impl From<&CachedPattern> for Detection {
    fn from(p: &CachedPattern) -> Self {
        Detection {
            pattern_name: p.pattern_name.clone(),
            symbol: p.symbol.clone(),
            confidence: p.confidence,
            detected_at: p.detected_at,
            tier: p.tier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    pub indicator_name: String,
    pub symbol: String,
    pub values: HashMap<String, f64>,
    pub computed_at: DateTime<Utc>,
    pub timeframe: Option<String>,
}

/// Events delivered to a client session. This crate never opens a
/// socket: it hands already-built `ServerEvent` values to whatever transport the
/// (out-of-scope) HTTP router owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "streaming_pattern")]
    StreamingPattern { detection: Detection },
    #[serde(rename = "streaming_patterns_batch")]
    StreamingPatternsBatch {
        count: usize,
        patterns: Vec<Detection>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "streaming_indicator")]
    StreamingIndicator { calculation: Calculation },
    #[serde(rename = "streaming_indicators_batch")]
    StreamingIndicatorsBatch {
        count: usize,
        indicators: Vec<Calculation>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "pattern_alert")]
    PatternAlert { detection: Detection, rule: String },
    #[serde(rename = "status_update")]
    StatusUpdate { status: serde_json::Value },
}

/// Client-to-server operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientOp {
    Subscribe { predicate: Predicate },
    Unsubscribe,
    JoinRoom { room: String },
    LeaveRoom { room: String },
}
