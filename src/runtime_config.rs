// =============================================================================
// Runtime Configuration — service tunables with serde defaults
// =============================================================================
//
// Every tunable of the market-pulse service lives here.  The JSON file is
// optional and may be partial: all fields carry `#[serde(default)]` so a
// missing key falls back to its default.  A handful of deployment settings
// can be overridden from the environment, and the upstream feed credentials
// are only ever read from the environment.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "market_pulse.db".to_string()
}

fn default_feed_url() -> String {
    "wss://smartapisocket.angelone.in/smart-stream".to_string()
}

fn default_subscription_mode() -> u8 {
    2
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_movers_ttl_secs() -> u64 {
    86_400
}

fn default_movers_limit() -> usize {
    5
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_tick_queue_capacity() -> usize {
    65_536
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_min_price() -> f64 {
    1.0
}

fn default_max_price() -> f64 {
    100_000.0
}

fn default_max_clock_skew_secs() -> u64 {
    86_400
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Upstream feed connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// 1 = LTP only, 2 = full quote.
    #[serde(default = "default_subscription_mode")]
    pub subscription_mode: u8,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Fixed delay before each reconnect attempt. Retries are unbounded.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            subscription_mode: default_subscription_mode(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Deployment ----------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite file holding candles, snapshots and the instrument table.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub feed: FeedConfig,

    // --- Schedules -----------------------------------------------------------

    /// Stale-candle sweep period.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Subscriber liveness ping period.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    // --- Views & fan-out -----------------------------------------------------

    #[serde(default = "default_movers_ttl_secs")]
    pub movers_ttl_secs: u64,

    /// Default `limit` for the movers endpoint.
    #[serde(default = "default_movers_limit")]
    pub movers_limit: usize,

    /// Per-subscriber backlog before a slow subscriber starts skipping.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Ticks waiting for the aggregation worker. Full queue drops the tick
    /// for candles only.
    #[serde(default = "default_tick_queue_capacity")]
    pub tick_queue_capacity: usize,

    // --- Market ----------------------------------------------------------------

    /// Market-local UTC offset used for trading-day boundaries (IST = 330).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_min_price")]
    pub min_price: f64,

    #[serde(default = "default_max_price")]
    pub max_price: f64,

    /// Exchange timestamps further than this from arrival time are replaced
    /// by the arrival time.
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            feed: FeedConfig::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            movers_ttl_secs: default_movers_ttl_secs(),
            movers_limit: default_movers_limit(),
            broadcast_capacity: default_broadcast_capacity(),
            tick_queue_capacity: default_tick_queue_capacity(),
            utc_offset_minutes: default_utc_offset_minutes(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            db_path = %config.db_path,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Load from `path`, falling back to defaults with a warning.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "runtime config unavailable, using defaults");
                Self::default()
            }
        }
    }

    /// Apply `MARKET_PULSE_*` environment overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MARKET_PULSE_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("MARKET_PULSE_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("MARKET_PULSE_FEED_URL") {
            self.feed.url = v;
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }
}

// =============================================================================
// FeedCredentials
// =============================================================================

/// Upstream feed credentials. Environment only, never written to disk.
#[derive(Clone)]
pub struct FeedCredentials {
    pub api_key: String,
    pub client_code: String,
    pub auth_token: String,
    pub feed_token: String,
}

impl std::fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("client_code", &self.client_code)
            .finish_non_exhaustive()
    }
}

impl FeedCredentials {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let mut missing = Vec::new();
        let mut get = |key: &'static str| {
            let v = lookup(key).filter(|v| !v.trim().is_empty());
            if v.is_none() {
                missing.push(key);
            }
            v.unwrap_or_default()
        };
        let creds = Self {
            api_key: get("FEED_API_KEY"),
            client_code: get("FEED_CLIENT_CODE"),
            auth_token: get("FEED_AUTH_TOKEN"),
            feed_token: get("FEED_TOKEN"),
        };

        if missing.is_empty() {
            Some(creds)
        } else {
            error!(missing = ?missing, "feed credentials incomplete, upstream feed disabled");
            None
        }
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}
