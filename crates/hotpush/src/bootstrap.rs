//! First-run bootstrap of the bundled content.
//!
//! Copies the application's bundled read-only content directory into the
//! writable release area and activates it. Runs when the ledger shows no
//! prior bootstrap or when the host application itself was upgraded
//! externally. On failure the application keeps serving the bundled
//! content directly; nothing else works until the next attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::UpdateError;
use crate::events::{EventBus, UpdateEvent};
use crate::layout::{self, FileLayout};

/// Copies bundled content into the writable release area.
pub struct BootstrapInstaller {
    root: PathBuf,
    bundle_dir: PathBuf,
    bus: EventBus,
}

impl BootstrapInstaller {
    pub fn new(root: impl Into<PathBuf>, bundle_dir: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            root: root.into(),
            bundle_dir: bundle_dir.into(),
            bus,
        }
    }

    /// Run the bundle copy on the blocking pool and publish the outcome.
    pub fn spawn_install(self: &Arc<Self>, bundled_release: String) {
        let bootstrap = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            match bootstrap.install_bundle(&bundled_release) {
                Ok(()) => {
                    info!("bundled content installed as release {bundled_release}");
                    bootstrap.bus.publish(UpdateEvent::AssetsInstalled);
                }
                Err(e) => {
                    warn!("asset bootstrap failed: {e}");
                    bootstrap
                        .bus
                        .publish(UpdateEvent::AssetsInstallationFailed(e));
                }
            }
        });
    }

    /// Copy the bundle into the release's content directory and switch
    /// the active pointer to it.
    pub fn install_bundle(&self, bundled_release: &str) -> Result<(), UpdateError> {
        if !self.bundle_dir.is_dir() {
            return Err(UpdateError::BootstrapFailed {
                reason: format!("bundle directory missing: {}", self.bundle_dir.display()),
            });
        }

        let content = FileLayout::for_release(&self.root, bundled_release).content_dir();

        // Restart from scratch: a partial copy from an earlier crash
        // must not survive into the new attempt.
        if content.exists() {
            std::fs::remove_dir_all(&content).map_err(|e| UpdateError::BootstrapFailed {
                reason: e.to_string(),
            })?;
        }

        copy_dir(&self.bundle_dir, &content).map_err(|e| UpdateError::BootstrapFailed {
            reason: e.to_string(),
        })?;

        layout::switch_active_release(&self.root, bundled_release)
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
