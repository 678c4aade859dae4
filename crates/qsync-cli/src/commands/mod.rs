//! Command handler modules for the `qsync` binary.
//!
//! Config loading and adapter startup shared by the commands live here.

pub mod account;
pub mod config;
pub mod market;

use anyhow::{Context, Result};
use tracing::info;

use qsync_adapter::QuikAdapter;
use qsync_config::{report_unknown_keys, LoadedConfig, UnknownKeyPolicy};
use qsync_schemas::{SeriesKey, Timeframe};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Merge `paths` (none = defaults + `QSYNC_*` overrides) and warn on unknown keys.
pub fn load_config(paths: &[String]) -> Result<LoadedConfig> {
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = qsync_config::load_layered_yaml(&refs)?;
    report_unknown_keys(&loaded.config_json, UnknownKeyPolicy::Warn)?;
    Ok(loaded)
}

/// Start an adapter and wait for the bridge connection. Fails once the
/// reconnect budget is spent.
pub async fn connect(paths: &[String]) -> Result<QuikAdapter> {
    let loaded = load_config(paths)?;
    info!(
        config_hash = %loaded.config_hash,
        host = %loaded.config.host,
        port = loaded.config.port,
        "connecting to bridge"
    );
    let adapter = QuikAdapter::start(loaded.config)?;
    adapter
        .wait_connected()
        .await
        .context("bridge not reachable")?;
    Ok(adapter)
}

/// Resolve `--ticker` and `--tf` into a series.
pub async fn series(adapter: &QuikAdapter, ticker: &str, tf: &str) -> Result<SeriesKey> {
    let timeframe = Timeframe::parse(tf).with_context(|| {
        format!("invalid --tf '{tf}'. expected one of: M1 M5 M10 M15 M30 H1 H4 D1 W1 MN ...")
    })?;
    let instrument = adapter
        .resolve(ticker)
        .await
        .with_context(|| format!("cannot resolve ticker '{ticker}'"))?;
    Ok(SeriesKey::new(instrument, timeframe))
}
