use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// One live network session. Lifetime equals connection lifetime: on disconnect all
/// subscriptions and room memberships owned by this client are torn down.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: String,
    pub session_id: String,
    pub rooms: HashSet<String>,
    pub rate_budget_remaining: u32,
    pub last_emit_ts: Option<DateTime<Utc>>,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, session_id: impl Into<String>, rate_limit: u32) -> Self {
        Self {
            client_id: client_id.into(),
            session_id: session_id.into(),
            rooms: HashSet::new(),
            rate_budget_remaining: rate_limit,
            last_emit_ts: None,
        }
    }
}
