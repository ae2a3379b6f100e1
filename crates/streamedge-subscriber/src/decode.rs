//! Decoding for producer bus payloads. All field-name aliasing (producers have drifted
//! over time between `pattern`/`pattern_type`/`pattern_name` for the same value) is
//! resolved here, in one place, exactly once; nothing downstream ever looks at a raw
//! JSON field.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use streamedge_types::event::{Event, LifecycleKind, Tier};
use streamedge_types::{StreamError, StreamResult};

fn first_non_empty_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Parses an ISO-8601 string or an epoch number (seconds, or milliseconds if the
/// magnitude implies it) from the first present key in `keys`.
fn parse_timestamp(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        let Some(field) = value.get(key) else { continue };
        if let Some(s) = field.as_str() {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(secs) = s.parse::<i64>() {
                return epoch_to_datetime(secs);
            }
            continue;
        }
        if let Some(n) = field.as_i64() {
            return epoch_to_datetime(n);
        }
        if let Some(n) = field.as_f64() {
            return epoch_to_datetime(n as i64);
        }
    }
    None
}

fn epoch_to_datetime(n: i64) -> Option<DateTime<Utc>> {
    // millisecond-resolution epochs exceed 1e12 for any date in this era; second
    // resolution never does, so the magnitude alone disambiguates.
    if n.abs() > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

fn parse_tier(value: &Value) -> Tier {
    match value.get("tier").and_then(Value::as_str) {
        Some("intraday") => Tier::Intraday,
        Some("combo") => Tier::Combo,
        _ => Tier::Daily,
    }
}

fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

/// `patterns.streaming` / `patterns.detected` → [`Event::PatternDetected`].
pub fn decode_pattern(payload: &[u8]) -> StreamResult<Event> {
    let root: Value = serde_json::from_slice(payload)?;
    let detection = root.get("detection").unwrap_or(&root);

    let pattern_name = first_non_empty_str(detection, &["pattern_name", "pattern_type", "pattern"])
        .ok_or_else(|| StreamError::MissingField("pattern_name".into()))?;
    let symbol = first_non_empty_str(detection, &["symbol"])
        .ok_or_else(|| StreamError::MissingField("symbol".into()))?;
    let confidence = detection
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| StreamError::MissingField("confidence".into()))?;
    let detected_at = parse_timestamp(detection, &["detected_at", "computed_at", "timestamp"])
        .ok_or_else(|| StreamError::MissingField("detected_at".into()))?;
    let expires_at = parse_timestamp(detection, &["expires_at"]);
    let id = first_non_empty_str(detection, &["id"]).unwrap_or_else(new_id);

    let attributes = detection
        .get("parameters")
        .or_else(|| detection.get("attributes"))
        .and_then(Value::as_object)
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Ok(Event::PatternDetected {
        id,
        symbol,
        pattern_name,
        tier: parse_tier(detection),
        confidence,
        detected_at,
        expires_at,
        attributes,
    })
}

/// `indicators.streaming` → [`Event::IndicatorCalculated`].
pub fn decode_indicator(payload: &[u8]) -> StreamResult<Event> {
    let root: Value = serde_json::from_slice(payload)?;
    let calculation = root.get("calculation").unwrap_or(&root);

    let indicator_name =
        first_non_empty_str(calculation, &["indicator_name", "indicator_type", "indicator"])
            .ok_or_else(|| StreamError::MissingField("indicator_name".into()))?;
    let symbol = first_non_empty_str(calculation, &["symbol"])
        .ok_or_else(|| StreamError::MissingField("symbol".into()))?;
    let computed_at = parse_timestamp(calculation, &["computed_at", "detected_at", "timestamp"])
        .ok_or_else(|| StreamError::MissingField("computed_at".into()))?;
    let id = first_non_empty_str(calculation, &["id"]).unwrap_or_else(new_id);
    let timeframe = first_non_empty_str(calculation, &["timeframe"]);

    let value = calculation
        .get("values")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default();

    Ok(Event::IndicatorCalculated {
        id,
        symbol,
        indicator_name,
        value,
        computed_at,
        timeframe,
    })
}

/// `streaming.health` → [`Event::StreamingHealth`].
pub fn decode_health(payload: &[u8]) -> StreamResult<Event> {
    let root: Value = serde_json::from_slice(payload)?;
    Ok(Event::StreamingHealth {
        status: root
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        active_symbols: root.get("active_symbols").and_then(Value::as_u64).unwrap_or(0),
        tps: root.get("tps").and_then(Value::as_f64).unwrap_or(0.0),
        ts: parse_timestamp(&root, &["ts", "timestamp"]).unwrap_or_else(Utc::now),
    })
}

/// `streaming.session_started` / `streaming.session_stopped` → [`Event::SessionLifecycle`].
pub fn decode_lifecycle(payload: &[u8], kind: LifecycleKind) -> StreamResult<Event> {
    let root: Value = serde_json::from_slice(payload)?;
    let session_id = first_non_empty_str(&root, &["session_id"])
        .ok_or_else(|| StreamError::MissingField("session_id".into()))?;
    Ok(Event::SessionLifecycle {
        kind,
        session_id,
        ts: parse_timestamp(&root, &["ts", "timestamp"]).unwrap_or_else(Utc::now),
    })
}

/// `alerts.critical` / `backtesting.progress` / `backtesting.results`: opaque
/// pass-throughs the consumer never inspects, just forwarded straight to the broadcaster.
pub fn decode_opaque(payload: &[u8], make: impl Fn(Value) -> Event) -> StreamResult<Event> {
    let root: Value = serde_json::from_slice(payload)?;
    Ok(make(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `pattern` alias alone decodes to the canonical `pattern_name`.
    #[test]
    fn field_alias_tolerance_for_pattern_name() {
        let payload = br#"{"type":"streaming_pattern","detection":{"pattern":"Doji","symbol":"AAPL","confidence":0.9,"detected_at":"2026-02-05T10:00:00Z"}}"#;
        let event = decode_pattern(payload).unwrap();
        assert_eq!(event.pattern_name(), Some("Doji"));
        assert_eq!(event.symbol(), Some("AAPL"));
    }

    #[test]
    fn pattern_type_alias_also_decodes() {
        let payload = br#"{"detection":{"pattern_type":"Hammer","symbol":"MSFT","confidence":0.7,"detected_at":1700000000}}"#;
        let event = decode_pattern(payload).unwrap();
        assert_eq!(event.pattern_name(), Some("Hammer"));
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let payload = br#"{"detection":{"pattern_name":"Doji","confidence":0.9,"detected_at":1700000000}}"#;
        assert!(matches!(
            decode_pattern(payload),
            Err(StreamError::MissingField(_))
        ));
    }

    #[test]
    fn missing_all_name_aliases_is_an_error() {
        let payload = br#"{"detection":{"symbol":"AAPL","confidence":0.9,"detected_at":1700000000}}"#;
        assert!(matches!(
            decode_pattern(payload),
            Err(StreamError::MissingField(_))
        ));
    }

    #[test]
    fn epoch_millis_and_seconds_both_parse() {
        let secs = br#"{"detection":{"pattern":"Doji","symbol":"AAPL","confidence":0.9,"detected_at":1700000000}}"#;
        let millis = br#"{"detection":{"pattern":"Doji","symbol":"AAPL","confidence":0.9,"detected_at":1700000000000}}"#;
        let a = decode_pattern(secs).unwrap();
        let b = decode_pattern(millis).unwrap();
        match (a, b) {
            (
                Event::PatternDetected { detected_at: ta, .. },
                Event::PatternDetected { detected_at: tb, .. },
            ) => assert_eq!(ta, tb),
            _ => panic!("expected pattern events"),
        }
    }

    #[test]
    fn indicator_alias_tolerance() {
        let payload = br#"{"calculation":{"indicator":"RSI","symbol":"AAPL","values":{"rsi":55.2},"computed_at":"2026-01-01T00:00:00Z"}}"#;
        let event = decode_indicator(payload).unwrap();
        match event {
            Event::IndicatorCalculated { indicator_name, .. } => assert_eq!(indicator_name, "RSI"),
            _ => panic!("expected indicator event"),
        }
    }
}
