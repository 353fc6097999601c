//! Application configuration, env-var driven with sane defaults.

use anyhow::{bail, Result};
use std::env;

/// Where order actions are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Orders go to the local engine subprocess over stdio.
    Simulated,
    /// Orders go to the live exchange over signed REST.
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Simulated => "simulated",
            ExecutionMode::Live => "live",
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,

    /// Engine subprocess command; unset disables the engine channel
    /// (only valid in live mode).
    pub engine_cmd: Option<String>,
    pub engine_args: Vec<String>,

    pub execution_mode: ExecutionMode,

    pub event_log_capacity: usize,
    pub activity_capacity: usize,

    /// Live-mode order status poll cadence.
    pub poll_interval_secs: u64,
    /// Minimum spacing between synthesized error events during outages.
    pub error_throttle_secs: u64,

    pub market_feed_enabled: bool,
    pub market_symbols: Vec<String>,
    pub market_poll_interval_secs: u64,
    /// Engine market feed older than this is considered stale.
    pub market_staleness_ms: i64,

    pub venue_api_key: Option<String>,
    pub venue_api_secret: Option<String>,
    pub venue_rest_base: String,
    pub venue_ws_base: String,
    pub listen_key_keepalive_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let engine_cmd = env::var("ENGINE_CMD").ok().filter(|s| !s.trim().is_empty());

        let engine_args = env::var("ENGINE_ARGS")
            .unwrap_or_default()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        let execution_mode = match env::var("EXECUTION_MODE")
            .unwrap_or_else(|_| "simulated".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "simulated" | "sim" => ExecutionMode::Simulated,
            "live" => ExecutionMode::Live,
            other => bail!("invalid EXECUTION_MODE: {other}"),
        };

        if execution_mode == ExecutionMode::Simulated && engine_cmd.is_none() {
            bail!("EXECUTION_MODE=simulated requires ENGINE_CMD");
        }

        let event_log_capacity = parse_env("EVENT_LOG_CAPACITY", 4096);
        let activity_capacity = parse_env("ACTIVITY_CAPACITY", 256);
        let poll_interval_secs = parse_env("ORDER_POLL_INTERVAL_SECS", 2);
        let error_throttle_secs = parse_env("ERROR_THROTTLE_SECS", 5);

        let market_feed_enabled = env::var("MARKET_FEED_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let market_symbols = env::var("MARKET_SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let market_poll_interval_secs = parse_env("MARKET_POLL_INTERVAL_SECS", 2);
        let market_staleness_ms = parse_env("MARKET_STALENESS_MS", 5_000);

        let venue_api_key = env::var("VENUE_API_KEY").ok().filter(|s| !s.is_empty());
        let venue_api_secret = env::var("VENUE_API_SECRET").ok().filter(|s| !s.is_empty());

        let venue_rest_base =
            env::var("VENUE_REST_BASE").unwrap_or_else(|_| "https://api.binance.com".to_string());
        let venue_ws_base = env::var("VENUE_WS_BASE")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string());

        // The venue expires listen keys after 60 minutes without a keepalive.
        let listen_key_keepalive_secs = parse_env("LISTEN_KEY_KEEPALIVE_SECS", 25 * 60);

        Ok(Self {
            port,
            engine_cmd,
            engine_args,
            execution_mode,
            event_log_capacity,
            activity_capacity,
            poll_interval_secs,
            error_throttle_secs,
            market_feed_enabled,
            market_symbols,
            market_poll_interval_secs,
            market_staleness_ms,
            venue_api_key,
            venue_api_secret,
            venue_rest_base,
            venue_ws_base,
            listen_key_keepalive_secs,
        })
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
