//! Unknown-key guard.
//!
//! The typed config silently ignores keys it does not know, which hides typos
//! such as `drop_prise_doji`. Callers choose whether stray keys are a warning
//! or an error.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every top-level key [`crate::AdapterConfig`] reads.
pub const KNOWN_KEYS: &[&str] = &[
    "host",
    "port",
    "event_port",
    "trade_account_id",
    "client_code_for_orders",
    "lots",
    "limit_kind",
    "currency",
    "futures_firm_id",
    "edp",
    "slippage_steps",
    "commission_per_lot",
    "commission_rate_bps",
    "data_dir",
    "drop_price_doji",
    "live_bars",
    "live_source",
    "count",
    "fromdate",
    "todate",
    "history_page_size",
    "history_max_pages",
    "cache_depth",
    "command_timeout_ms",
    "connect_timeout_ms",
    "initial_backoff_ms",
    "max_backoff_ms",
    "backoff_multiplier",
    "max_reconnect_attempts",
    "event_queue_capacity",
    "feed_queue_capacity",
    "snapshot_interval_secs",
    "account_refresh_secs",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownKeyReport {
    /// Sorted, unique.
    pub unknown_keys: Vec<String>,
}

impl UnknownKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unknown_keys.is_empty()
    }
}

/// Report top-level keys of a merged config document that no field consumes.
/// With `Fail`, any unknown key is an error; with `Warn` each one is logged.
pub fn report_unknown_keys(config_json: &Value, policy: UnknownKeyPolicy) -> Result<UnknownKeyReport> {
    let known: BTreeSet<&str> = KNOWN_KEYS.iter().copied().collect();

    let unknown: BTreeSet<String> = match config_json {
        Value::Object(map) => map
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect(),
        _ => BTreeSet::new(),
    };

    let report = UnknownKeyReport {
        unknown_keys: unknown.into_iter().collect(),
    };

    if !report.is_clean() {
        match policy {
            UnknownKeyPolicy::Fail => bail!(
                "CONFIG_UNKNOWN_KEYS: {} unknown key(s): {:?}",
                report.unknown_keys.len(),
                report.unknown_keys
            ),
            UnknownKeyPolicy::Warn => {
                for key in &report.unknown_keys {
                    tracing::warn!(key = %key, "unknown config key ignored");
                }
            }
        }
    }

    Ok(report)
}
