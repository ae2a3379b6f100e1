use clap::{Args, Parser};

/// Top-level command-line/environment configuration for the streamedge pipeline.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Consumer-tier market-data streaming pipeline")]
pub struct CliArgs {
    #[clap(flatten)]
    pub bus: BusArgs,

    #[clap(flatten)]
    pub buffer: BufferArgs,

    #[clap(flatten)]
    pub cache: CacheArgs,

    #[clap(flatten)]
    pub rate: RateArgs,

    #[clap(flatten)]
    pub deadline: DeadlineArgs,

    /// Instance id, used for log and metric tagging.
    #[clap(long, env, global = true, default_value_t = format!("streamedge@{}", ulid::Ulid::new()))]
    pub instance_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct BusArgs {
    /// Redis connection string(s). A single value connects to a standalone node; more
    /// than one switches to cluster mode.
    #[clap(long, env, value_delimiter = ',')]
    pub bus_address: Vec<String>,
    /// Redis logical database index (standalone mode only).
    #[clap(long, env)]
    pub bus_db: Option<u8>,
    #[clap(long, env)]
    pub bus_password: Option<String>,
}

impl BusArgs {
    pub fn connection_url(&self) -> Option<String> {
        let first = self.bus_address.first()?;
        if self.bus_address.len() > 1 {
            return Some(first.clone());
        }

        let scheme = if first.starts_with("rediss://") {
            "rediss"
        } else {
            "redis"
        };
        let without_scheme = first
            .strip_prefix("redis://")
            .or_else(|| first.strip_prefix("rediss://"))
            .unwrap_or(first);
        // Split off any path (`/db`) the caller already embedded, so bus_db can
        // override it without producing `host/0/1`.
        let (authority, embedded_db) = match without_scheme.split_once('/') {
            Some((host, db)) => (host, Some(db)),
            None => (without_scheme, None),
        };
        let authority = if authority.contains('@') || self.bus_password.is_none() {
            authority.to_string()
        } else {
            let password = self.bus_password.as_deref().unwrap_or("");
            format!(":{password}@{authority}")
        };
        let db = self
            .bus_db
            .map(|db| db.to_string())
            .or_else(|| embedded_db.map(str::to_string));

        Some(match db {
            Some(db) => format!("{scheme}://{authority}/{db}"),
            None => format!("{scheme}://{authority}"),
        })
    }

    pub fn is_cluster(&self) -> bool {
        self.bus_address.len() > 1
    }
}

#[derive(Args, Debug, Clone)]
pub struct BufferArgs {
    /// Milliseconds between streaming buffer flushes.
    #[clap(long, env, default_value_t = 250)]
    pub buffer_interval_ms: u64,
    /// Forced flush once a (kind, key) batch reaches this many distinct keys.
    #[clap(long, env, default_value_t = 100)]
    pub buffer_max_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Default pattern cache TTL in seconds, used when a payload carries no `expires_at`.
    #[clap(long, env, default_value_t = 3600)]
    pub pattern_ttl_sec: i64,
    /// How long a query-service response may be served from its micro-cache.
    #[clap(long, env, default_value_t = 30)]
    pub response_cache_ttl_sec: u64,
    /// How long a client's subscription-index entry survives without renewal.
    #[clap(long, env, default_value_t = 3600)]
    pub index_ttl_sec: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RateArgs {
    /// Maximum events delivered to a single client per rolling second.
    #[clap(long, env, default_value_t = 100)]
    pub rate_limit_events_per_sec: u32,
}

#[derive(Args, Debug, Clone)]
pub struct DeadlineArgs {
    /// Soft deadline, in milliseconds, for a single per-session send before it's dropped.
    #[clap(long, env, default_value_t = 50)]
    pub per_send_deadline_ms: u64,
    /// Cooperative deadline, in milliseconds, for a single scan/query call.
    #[clap(long, env, default_value_t = 1000)]
    pub query_deadline_ms: u64,
}
