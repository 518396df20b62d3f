//! Durable release ledger.
//!
//! One JSON document recording which release is active, which was active
//! before it, which is staged for installation, and bootstrap bookkeeping.
//! Writes go through temp-file-plus-rename so a torn write can never
//! produce a ledger with an inconsistent current/previous pair.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Durable record of the release lifecycle. One instance per process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseLedger {
    /// Release the application is presently serving content from.
    pub current_release: String,
    /// Release active before the current one; used for rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_release: Option<String>,
    /// Fully downloaded, staged release awaiting activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_install_release: Option<String>,
    /// Whether the initial writable copy of bundled content completed.
    #[serde(default)]
    pub assets_bootstrapped: bool,
    /// Host application build id observed at last successful bootstrap.
    /// A different live build id means the host app was upgraded
    /// externally, which invalidates the writable copy.
    #[serde(default)]
    pub host_build_id: i64,
    /// When this ledger was last written.
    pub updated_at: DateTime<Utc>,
}

impl ReleaseLedger {
    /// Defaults for a first run: the bundled release is nominally
    /// current, nothing staged, bootstrap pending.
    pub fn new_default(bundled_release: &str) -> Self {
        Self {
            current_release: bundled_release.to_string(),
            previous_release: None,
            ready_to_install_release: None,
            assets_bootstrapped: false,
            host_build_id: 0,
            updated_at: Utc::now(),
        }
    }

    /// Shift after a successful install: the installed release becomes
    /// current, the old current becomes previous, staging clears.
    pub fn record_install(&mut self, installed_release: &str) {
        self.previous_release = Some(std::mem::replace(
            &mut self.current_release,
            installed_release.to_string(),
        ));
        self.ready_to_install_release = None;
    }

    /// Rewind to the previous release. Returns the release that became
    /// current, or `None` when there is no previous release to rewind to.
    pub fn rewind(&mut self) -> Option<String> {
        let previous = self.previous_release.take()?;
        self.current_release = previous.clone();
        self.ready_to_install_release = None;
        Some(previous)
    }
}

/// Loads and saves the ledger at a fixed path.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted ledger. `LedgerNotFound` on first run; the
    /// caller supplies defaults.
    pub fn load(&self) -> Result<ReleaseLedger, UpdateError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UpdateError::LedgerNotFound)
            }
            Err(e) => {
                return Err(UpdateError::PersistenceError {
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_str(&raw).map_err(|e| UpdateError::PersistenceError {
            reason: format!("ledger unreadable: {e}"),
        })
    }

    /// Persist the ledger crash-safely: write to a temp file in the same
    /// directory, fsync, then rename over the target.
    pub fn save(&self, ledger: &ReleaseLedger) -> Result<(), UpdateError> {
        let mut stamped = ledger.clone();
        stamped.updated_at = Utc::now();

        let raw = serde_json::to_string_pretty(&stamped).map_err(|e| {
            UpdateError::PersistenceError {
                reason: e.to_string(),
            }
        })?;

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let temp_path = self.path.with_extension("tmp");
            let mut file = File::create(&temp_path)?;
            file.write_all(raw.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)?;
            Ok(())
        };

        write().map_err(|e| UpdateError::PersistenceError {
            reason: e.to_string(),
        })
    }
}
