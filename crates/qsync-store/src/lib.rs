//! qsync-store
//!
//! On-disk snapshots under `data_dir`: one CSV bar cache per series and one
//! `state.json` per adapter. Writes go to a sibling temp file and are renamed
//! into place, so a crash mid-write leaves the previous snapshot intact.
//! Unreadable snapshots are discarded with a warning, never fatal.

pub mod bars;
pub mod state;

use std::fmt;
use std::io::Write;
use std::path::Path;

pub use bars::{read_csv, write_csv, BarCache};
pub use state::{load_state, read_state, save_state, StateEnvelope, STATE_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Io(String),
    Csv(String),
    Json(String),
    Corrupt { reason: String },
}

impl StoreError {
    pub(crate) fn csv(e: csv::Error) -> Self {
        StoreError::Csv(e.to_string())
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "store io error: {msg}"),
            StoreError::Csv(msg) => write!(f, "csv error: {msg}"),
            StoreError::Json(msg) => write!(f, "json error: {msg}"),
            StoreError::Corrupt { reason } => write!(f, "corrupt snapshot: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Write `bytes` to `path` via `path.tmp` + rename. Creates parent dirs.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io = |e: std::io::Error| StoreError::Io(format!("{}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);

    let mut f = std::fs::File::create(&tmp).map_err(io)?;
    f.write_all(bytes).map_err(io)?;
    f.sync_all().map_err(io)?;
    drop(f);
    std::fs::rename(&tmp, path).map_err(io)?;
    Ok(())
}
