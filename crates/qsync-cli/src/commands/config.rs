//! `qsync config-check`.

use anyhow::Result;

use qsync_config::{report_unknown_keys, UnknownKeyPolicy};

pub fn config_check(paths: &[String], strict: bool) -> Result<()> {
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = qsync_config::load_layered_yaml(&refs)?;

    let policy = if strict {
        UnknownKeyPolicy::Fail
    } else {
        UnknownKeyPolicy::Warn
    };
    let report = report_unknown_keys(&loaded.config_json, policy)?;

    println!("config_ok=true");
    println!("config_hash={}", loaded.config_hash);
    println!("unknown_keys={}", report.unknown_keys.join(","));
    println!("{}", loaded.canonical_json);
    Ok(())
}
