//! Reconciler state on disk.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use qsync_config::AdapterConfig;
use qsync_reconcile::{CommissionModel, Reconciler, ReconcilerSnapshot};
use qsync_store::{load_state, save_state};

/// Restore from `state.json` when it is readable, otherwise start empty.
pub(crate) fn load_reconciler(cfg: &AdapterConfig, config_hash: &str) -> Reconciler {
    let commission = CommissionModel::from_config(cfg);
    let path = cfg.state_file();
    match load_state::<ReconcilerSnapshot>(&path, config_hash) {
        Some(env) => {
            info!(
                path = %path.display(),
                saved_at = %env.saved_at,
                orders = env.state.orders.len(),
                fills = env.state.fills.len(),
                "reconciler state restored"
            );
            Reconciler::restore(env.state, cfg.lots, commission)
        }
        None => Reconciler::new(cfg.lots, commission),
    }
}

pub(crate) fn save_reconciler(cfg: &AdapterConfig, config_hash: &str, snapshot: &ReconcilerSnapshot) -> Result<()> {
    let path = cfg.state_file();
    save_state(&path, config_hash, snapshot, Utc::now())
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_corrupt_state_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AdapterConfig {
            data_dir: dir.path().to_path_buf(),
            ..AdapterConfig::default()
        };
        assert_eq!(load_reconciler(&cfg, "h").last_order_ref(), 0);

        std::fs::write(cfg.state_file(), b"{\"version\": 1, \"orders\": [").unwrap();
        assert_eq!(load_reconciler(&cfg, "h").last_order_ref(), 0);
    }

    #[test]
    fn saved_state_restores_order_refs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AdapterConfig {
            data_dir: dir.path().to_path_buf(),
            ..AdapterConfig::default()
        };
        let mut snap = Reconciler::new(false, CommissionModel::from_config(&cfg)).snapshot();
        snap.last_order_ref = 41;
        snap.cash = 1_000_000;
        save_reconciler(&cfg, "h", &snap).unwrap();

        let rec = load_reconciler(&cfg, "h");
        assert_eq!(rec.last_order_ref(), 41);
        assert_eq!(rec.cash(), 1_000_000);
    }
}
