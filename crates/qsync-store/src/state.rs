//! `state.json`: the reconciler snapshot wrapped in a versioned envelope.
//!
//! The envelope is generic over the payload so this crate stays independent
//! of the reconciler's types.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{write_atomic, StoreError};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope<T> {
    pub version: u32,
    pub config_hash: String,
    pub saved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: T,
}

/// Write `state` atomically.
pub fn save_state<T: Serialize>(
    path: &Path,
    config_hash: &str,
    state: &T,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let env = StateEnvelope {
        version: STATE_VERSION,
        config_hash: config_hash.to_string(),
        saved_at: now,
        state,
    };
    let bytes = serde_json::to_vec_pretty(&env).map_err(|e| StoreError::Json(e.to_string()))?;
    write_atomic(path, &bytes)?;
    debug!(path = %path.display(), "state snapshot written");
    Ok(())
}

/// Read and validate a state file without deciding what to do on failure.
pub fn read_state<T: DeserializeOwned>(path: &Path) -> Result<StateEnvelope<T>, StoreError> {
    let bytes = std::fs::read(path).map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
    let env: StateEnvelope<T> =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(e.to_string()))?;
    if env.version != STATE_VERSION {
        return Err(StoreError::corrupt(format!(
            "state version {} (expected {STATE_VERSION})",
            env.version
        )));
    }
    Ok(env)
}

/// Startup load. Missing → `None`; corrupt or wrong version → warn and
/// `None` (cold start). A config hash different from `expected_hash` is
/// logged and the state is still used.
pub fn load_state<T: DeserializeOwned>(path: &Path, expected_hash: &str) -> Option<StateEnvelope<T>> {
    if !path.exists() {
        debug!(path = %path.display(), "no state snapshot");
        return None;
    }
    match read_state::<T>(path) {
        Ok(env) => {
            if env.config_hash != expected_hash {
                warn!(
                    saved = %env.config_hash,
                    current = %expected_hash,
                    "state snapshot written under a different config"
                );
            }
            Some(env)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt state snapshot discarded, cold start");
            None
        }
    }
}
