//! qsync-config
//!
//! Typed adapter configuration. Every recognized option is a field of
//! [`AdapterConfig`] with its default; a config is validated once, when it is
//! loaded, and never re-checked per call.
//!
//! Loading merges YAML layers in order (later layers override earlier ones),
//! applies `QSYNC_*` environment overrides, computes a SHA-256 hash of the
//! canonical JSON and only then deserializes into the typed struct.

pub mod keys;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use keys::{report_unknown_keys, UnknownKeyPolicy, UnknownKeyReport, KNOWN_KEYS};

// ---------------------------------------------------------------------------
// LiveSource
// ---------------------------------------------------------------------------

/// Where live bars come from once backfill is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LiveSource {
    /// Aggregate anonymous trades (`OnAllTrade`) into bars locally.
    #[default]
    Ticks,
    /// Forward the bridge's own `NewCandle` pushes once each bar has closed.
    Candles,
}

// ---------------------------------------------------------------------------
// AdapterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    // Bridge address.
    pub host: String,
    pub port: u16,
    /// Event port; `port + 1` when absent.
    pub event_port: Option<u16>,

    // Account routing.
    pub trade_account_id: Option<String>,
    /// Some brokers require a dedicated client code on every transaction.
    pub client_code_for_orders: Option<String>,
    /// Terminal quantities are lot-denominated.
    pub lots: bool,
    /// Trading-mode selector for money/depo limits (T0, T1, ...).
    pub limit_kind: i64,
    pub currency: String,
    pub futures_firm_id: String,
    /// Unified cash position accounting.
    pub edp: bool,
    /// Price steps added to the last price for derivative market orders.
    pub slippage_steps: i64,
    pub commission_per_lot: f64,
    pub commission_rate_bps: f64,

    // Market data.
    pub data_dir: PathBuf,
    pub drop_price_doji: bool,
    pub live_bars: bool,
    pub live_source: LiveSource,
    /// Default historical depth in bars.
    pub count: usize,
    pub fromdate: Option<NaiveDateTime>,
    pub todate: Option<NaiveDateTime>,
    pub history_page_size: usize,
    pub history_max_pages: usize,
    /// Bars kept per series in the on-disk cache.
    pub cache_depth: usize,

    // Session.
    pub command_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_reconnect_attempts: u32,
    pub event_queue_capacity: usize,
    pub feed_queue_capacity: usize,

    // Background tasks.
    pub snapshot_interval_secs: u64,
    pub account_refresh_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 34130,
            event_port: None,
            trade_account_id: None,
            client_code_for_orders: None,
            lots: true,
            limit_kind: 1,
            currency: "SUR".to_string(),
            futures_firm_id: "SPBFUT".to_string(),
            edp: false,
            slippage_steps: 10,
            commission_per_lot: 0.0,
            commission_rate_bps: 0.0,
            data_dir: PathBuf::from("DataQuik"),
            drop_price_doji: false,
            live_bars: false,
            live_source: LiveSource::Ticks,
            count: 2000,
            fromdate: None,
            todate: None,
            history_page_size: 1000,
            history_max_pages: 64,
            cache_depth: 5000,
            command_timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 10,
            event_queue_capacity: 4096,
            feed_queue_capacity: 1024,
            snapshot_interval_secs: 60,
            account_refresh_secs: 30,
        }
    }
}

impl AdapterConfig {
    pub fn event_port(&self) -> u16 {
        self.event_port.unwrap_or_else(|| self.port.saturating_add(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// Check every cross-field constraint once.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |key: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };

        if self.host.trim().is_empty() {
            return invalid("host", "must not be empty");
        }
        if self.port == 0 {
            return invalid("port", "must be non-zero");
        }
        if self.event_port() == 0 || self.event_port() == self.port {
            return invalid("event_port", "must be non-zero and differ from port");
        }
        if self.count == 0 {
            return invalid("count", "must be > 0");
        }
        if self.history_page_size == 0 || self.history_max_pages == 0 {
            return invalid("history_page_size", "paging limits must be > 0");
        }
        if self.event_queue_capacity == 0 || self.feed_queue_capacity == 0 {
            return invalid("event_queue_capacity", "queue capacities must be > 0");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier", "must be finite and >= 1.0");
        }
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return invalid("initial_backoff_ms", "must be > 0 and <= max_backoff_ms");
        }
        if self.command_timeout_ms == 0 {
            return invalid("command_timeout_ms", "must be > 0");
        }
        if self.slippage_steps < 0 {
            return invalid("slippage_steps", "must be >= 0");
        }
        if !(self.commission_per_lot.is_finite() && self.commission_per_lot >= 0.0)
            || !(self.commission_rate_bps.is_finite() && self.commission_rate_bps >= 0.0)
        {
            return invalid("commission_per_lot", "commissions must be finite and >= 0");
        }
        if let (Some(from), Some(to)) = (self.fromdate, self.todate) {
            if from > to {
                return invalid("fromdate", "must not be after todate");
            }
        }
        if self.data_dir.as_os_str().is_empty() {
            return invalid("data_dir", "must not be empty");
        }
        if self.snapshot_interval_secs == 0 {
            return invalid("snapshot_interval_secs", "must be > 0");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, reason } => {
                write!(f, "CONFIG_INVALID key={key}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Layered loading
// ---------------------------------------------------------------------------

/// Result of loading layered YAML: the typed config plus its provenance.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AdapterConfig,
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

/// Environment variables that override a single top-level key.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("QSYNC_HOST", "host"),
    ("QSYNC_PORT", "port"),
    ("QSYNC_DATA_DIR", "data_dir"),
    ("QSYNC_TRADE_ACCOUNT_ID", "trade_account_id"),
];

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }
    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs, |name| std::env::var(name).ok())
}

/// Merge YAML documents in order, apply overrides from `env`, hash, then
/// deserialize and validate.
pub fn load_layered_yaml_from_strings(
    yaml_docs: &[&str],
    env: impl Fn(&str) -> Option<String>,
) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = match serde_json::to_value(v_yaml).context("yaml->json conversion failed")? {
            Value::Null => serde_json::json!({}),
            other => other,
        };
        merged = deep_merge(merged, v_json);
    }

    apply_env_overrides(&mut merged, env);

    let canonical_json =
        serde_json::to_string(&merged).context("canonical json serialize failed")?;
    let config_hash = sha256_hex(canonical_json.as_bytes());

    let config: AdapterConfig =
        serde_json::from_value(merged.clone()).context("config does not match AdapterConfig")?;
    config.validate()?;

    tracing::debug!(config_hash = %config_hash, "config loaded");

    Ok(LoadedConfig {
        config,
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Hash of an already-typed config (used when a config is built in code).
pub fn config_hash(config: &AdapterConfig) -> Result<String> {
    let v = serde_json::to_value(config).context("config serialize failed")?;
    let canonical = serde_json::to_string(&v).context("canonical json serialize failed")?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn apply_env_overrides(merged: &mut Value, env: impl Fn(&str) -> Option<String>) {
    let Value::Object(map) = merged else {
        return;
    };
    for (var, key) in ENV_OVERRIDES {
        if let Some(raw) = env(var) {
            let value = match *key {
                "port" => raw
                    .trim()
                    .parse::<u64>()
                    .map(Value::from)
                    .unwrap_or(Value::String(raw)),
                _ => Value::String(raw),
            };
            map.insert((*key).to_string(), value);
        }
    }
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
