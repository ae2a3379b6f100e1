use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scalar attribute value carried on a pattern's `attributes` map or an indicator's
/// `value` map. Kept as `serde_json::Value` rather than a closed enum since upstream
/// payloads are free to attach arbitrary numeric/string/bool fields.
pub type Scalar = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Intraday,
    Combo,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Daily => write!(f, "daily"),
            Tier::Intraday => write!(f, "intraday"),
            Tier::Combo => write!(f, "combo"),
        }
    }
}

/// Discriminator used for dispatch and subscription matching. Kept as a small enum
/// switched on explicitly rather than looked up via runtime type inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Pattern,
    Indicator,
    Health,
    Lifecycle,
    CriticalAlert,
    BacktestProgress,
    BacktestResult,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Pattern => "pattern",
            EventKind::Indicator => "indicator",
            EventKind::Health => "health",
            EventKind::Lifecycle => "lifecycle",
            EventKind::CriticalAlert => "critical_alert",
            EventKind::BacktestProgress => "backtest_progress",
            EventKind::BacktestResult => "backtest_result",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    Started,
    Stopped,
}

/// The canonical, already-normalized event as it flows internally between
/// EventSubscriber, PatternCache, StreamingBuffer and Broadcaster. Producer field-name
/// drift (see §6.1) is resolved once, at decode time, before an `Event` is ever built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    #[serde(rename = "pattern")]
    PatternDetected {
        id: String,
        symbol: String,
        pattern_name: String,
        tier: Tier,
        confidence: f64,
        detected_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        attributes: HashMap<String, Scalar>,
    },
    #[serde(rename = "indicator")]
    IndicatorCalculated {
        id: String,
        symbol: String,
        indicator_name: String,
        value: HashMap<String, f64>,
        computed_at: DateTime<Utc>,
        timeframe: Option<String>,
    },
    #[serde(rename = "health")]
    StreamingHealth {
        status: String,
        active_symbols: u64,
        tps: f64,
        ts: DateTime<Utc>,
    },
    #[serde(rename = "lifecycle")]
    SessionLifecycle {
        kind: LifecycleKind,
        session_id: String,
        ts: DateTime<Utc>,
    },
    #[serde(rename = "backtest_progress")]
    BacktestProgress { payload: serde_json::Value },
    #[serde(rename = "backtest_result")]
    BacktestResult { payload: serde_json::Value },
    #[serde(rename = "critical_alert")]
    CriticalAlert { payload: serde_json::Value },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PatternDetected { .. } => EventKind::Pattern,
            Event::IndicatorCalculated { .. } => EventKind::Indicator,
            Event::StreamingHealth { .. } => EventKind::Health,
            Event::SessionLifecycle { .. } => EventKind::Lifecycle,
            Event::BacktestProgress { .. } => EventKind::BacktestProgress,
            Event::BacktestResult { .. } => EventKind::BacktestResult,
            Event::CriticalAlert { .. } => EventKind::CriticalAlert,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Event::PatternDetected { symbol, .. } => Some(symbol),
            Event::IndicatorCalculated { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            Event::PatternDetected { tier, .. } => Some(*tier),
            _ => None,
        }
    }

    pub fn pattern_name(&self) -> Option<&str> {
        match self {
            Event::PatternDetected { pattern_name, .. } => Some(pattern_name),
            _ => None,
        }
    }

    pub fn indicator_name(&self) -> Option<&str> {
        match self {
            Event::IndicatorCalculated { indicator_name, .. } => Some(indicator_name),
            _ => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Event::PatternDetected { confidence, .. } => Some(*confidence),
            _ => None,
        }
    }

    /// Whether this event kind is routed through the streaming buffer for
    /// aggregation, as opposed to going straight to the broadcaster (health,
    /// lifecycle, critical alerts, backtest updates).
    pub fn is_buffered(&self) -> bool {
        matches!(
            self,
            Event::PatternDetected { .. } | Event::IndicatorCalculated { .. }
        )
    }
}
