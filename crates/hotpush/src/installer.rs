//! Update installer: activates a staged release.
//!
//! Activation is two renames: staging becomes the release's content
//! directory, then the `current` link is swapped. The previously active
//! release directory is never touched before the new one is live, so a
//! failed switch leaves the old release fully intact and selectable.
//! Same single-flight discipline as the loader.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{OperationKind, UpdateError};
use crate::events::{EventBus, UpdateEvent};
use crate::layout::{self, FileLayout};
use crate::loader::InFlightGuard;
use crate::manifest::{ContentManifest, ManifestStore};

/// Activates staged releases.
pub struct UpdateInstaller {
    root: PathBuf,
    manifests: ManifestStore,
    bus: EventBus,
    in_flight: Arc<AtomicBool>,
}

impl UpdateInstaller {
    pub fn new(root: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            root: root.into(),
            manifests: ManifestStore,
            bus,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether an install is currently executing.
    pub fn is_installing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start an install on the blocking pool. Rejects synchronously with
    /// `AlreadyInFlight`; every other outcome arrives as an event.
    pub fn spawn_install(
        self: &Arc<Self>,
        staged_release: Option<String>,
        current_release: String,
    ) -> Result<(), UpdateError> {
        let guard = InFlightGuard::claim(&self.in_flight, OperationKind::Install)?;
        let installer = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            installer.run_install(guard, staged_release, &current_release);
        });
        Ok(())
    }

    fn run_install(
        &self,
        _guard: InFlightGuard,
        staged_release: Option<String>,
        current_release: &str,
    ) {
        let Some(staged) = staged_release.filter(|r| !r.is_empty()) else {
            info!("nothing to install");
            self.bus.publish(UpdateEvent::NothingToInstall);
            return;
        };

        match self.install_inner(&staged) {
            Ok(manifest) => {
                info!(
                    "release {} installed over {current_release}",
                    manifest.release
                );
                self.bus.publish(UpdateEvent::UpdateInstalled(manifest));
            }
            Err(e) => {
                warn!("installation of {staged} failed: {e}");
                self.bus.publish(UpdateEvent::UpdateInstallationFailed(e));
            }
        }
    }

    fn install_inner(&self, staged_release: &str) -> Result<ContentManifest, UpdateError> {
        let staged_layout = FileLayout::for_release(&self.root, staged_release);
        let staging = staged_layout.staging_dir();
        let content = staged_layout.content_dir();

        // A crash after finalize but before the switch leaves a complete
        // content directory and no staging; pick up from there.
        let manifest = if staging.is_dir() {
            let manifest = self
                .manifests
                .load_from(&staging)
                .map_err(|_| UpdateError::StagedManifestNotFound)?;
            self.finalize_staging(&staging, &content)?;
            manifest
        } else {
            self.manifests
                .load_from(&content)
                .map_err(|_| UpdateError::StagedManifestNotFound)?
        };

        layout::switch_active_release(&self.root, staged_release)?;
        Ok(manifest)
    }

    /// Promote a complete staging directory to the release's content
    /// directory with a single rename.
    fn finalize_staging(
        &self,
        staging: &std::path::Path,
        content: &std::path::Path,
    ) -> Result<(), UpdateError> {
        if content.exists() {
            std::fs::remove_dir_all(content).map_err(|e| UpdateError::LayoutError {
                reason: format!("failed to clear old content dir: {e}"),
            })?;
        }
        std::fs::rename(staging, content).map_err(|e| UpdateError::LayoutError {
            reason: format!("failed to finalize staging: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::UpdateTiming;
    use tempfile::TempDir;

    fn installer_for(temp: &TempDir) -> (Arc<UpdateInstaller>, tokio::sync::mpsc::UnboundedReceiver<UpdateEvent>) {
        let (bus, rx) = EventBus::new();
        (Arc::new(UpdateInstaller::new(temp.path(), bus)), rx)
    }

    fn stage_release(root: &std::path::Path, release: &str) {
        let staging = FileLayout::for_release(root, release).staging_dir();
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("index.html"), release).unwrap();
        ManifestStore
            .save_to(
                &staging,
                &ContentManifest {
                    release: release.to_string(),
                    update: UpdateTiming::OnNextStart,
                    content_url: "https://cdn.example.com/".to_string(),
                    store_url: None,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn empty_staged_release_publishes_nothing_to_install() {
        let temp = TempDir::new().unwrap();
        let (installer, mut rx) = installer_for(&temp);

        installer.spawn_install(None, "1.0".to_string()).unwrap();
        assert_eq!(rx.recv().await, Some(UpdateEvent::NothingToInstall));
        assert!(!installer.is_installing());
    }

    #[tokio::test]
    async fn missing_staged_manifest_is_a_corruption_signal() {
        let temp = TempDir::new().unwrap();
        let (installer, mut rx) = installer_for(&temp);

        // Staging directory exists but carries no manifest.
        std::fs::create_dir_all(FileLayout::for_release(temp.path(), "2.0").staging_dir())
            .unwrap();

        installer
            .spawn_install(Some("2.0".to_string()), "1.0".to_string())
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(UpdateEvent::UpdateInstallationFailed(
                UpdateError::StagedManifestNotFound
            ))
        );
        // The active pointer was never created, let alone moved.
        assert_eq!(layout::active_content_dir(temp.path()), None);
    }

    #[tokio::test]
    async fn successful_install_switches_the_active_release() {
        let temp = TempDir::new().unwrap();
        let (installer, mut rx) = installer_for(&temp);
        stage_release(temp.path(), "2.0");

        installer
            .spawn_install(Some("2.0".to_string()), "1.0".to_string())
            .unwrap();

        match rx.recv().await {
            Some(UpdateEvent::UpdateInstalled(manifest)) => {
                assert_eq!(manifest.release, "2.0")
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let content = FileLayout::for_release(temp.path(), "2.0").content_dir();
        assert_eq!(layout::active_content_dir(temp.path()), Some(content.clone()));
        assert_eq!(
            std::fs::read_to_string(content.join("index.html")).unwrap(),
            "2.0"
        );
        // Staging was promoted, not copied.
        assert!(!FileLayout::for_release(temp.path(), "2.0")
            .staging_dir()
            .exists());
    }

    #[tokio::test]
    async fn second_install_while_one_runs_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (installer, _rx) = installer_for(&temp);

        let _guard =
            InFlightGuard::claim(&installer.in_flight, OperationKind::Install).unwrap();
        let err = installer
            .spawn_install(Some("2.0".to_string()), "1.0".to_string())
            .unwrap_err();
        assert!(matches!(
            err,
            UpdateError::AlreadyInFlight {
                operation: OperationKind::Install
            }
        ));
    }
}
