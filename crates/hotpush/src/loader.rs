//! Update loader: compares the remote release against the active one and
//! stages changed content.
//!
//! Single-flight per process: a compare-and-swap token rejects a second
//! fetch while one executes. The token is cleared by an RAII guard on
//! every exit path. All outcomes are published as events; nothing
//! escapes the loader boundary as a panic or unpublished error.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{OperationKind, UpdateError};
use crate::events::{EventBus, UpdateEvent};
use crate::layout::FileLayout;
use crate::manifest::{ContentIndex, ContentManifest, ManifestStore};
use crate::transport::UpdateTransport;

/// Clears the single-flight flag when the operation finishes, no matter
/// how it finishes.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    /// Claim the flag, or reject with `AlreadyInFlight`.
    pub(crate) fn claim(
        flag: &Arc<AtomicBool>,
        operation: OperationKind,
    ) -> Result<Self, UpdateError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| UpdateError::AlreadyInFlight { operation })?;
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Hex sha256 of a byte slice.
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex sha256 of a file, or `None` if it cannot be read.
fn file_sha256_hex(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|bytes| sha256_hex(&bytes))
}

/// Reject absolute paths and parent-directory components in index
/// entries; a hostile index must not write outside the staging dir.
fn safe_relative_path(file: &str) -> Result<PathBuf, UpdateError> {
    let path = Path::new(file);
    let clean = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !clean || file.is_empty() {
        return Err(UpdateError::LayoutError {
            reason: format!("unsafe content path: {file}"),
        });
    }
    Ok(path.to_path_buf())
}

/// A release identifier names a directory under the storage root, so a
/// remote manifest may only supply a single normal path component.
fn safe_release_id(release: &str) -> Result<(), UpdateError> {
    let mut components = Path::new(release).components();
    let single = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !single {
        return Err(UpdateError::ManifestCorrupt {
            reason: format!("unsafe release identifier: {release:?}"),
        });
    }
    Ok(())
}

enum FetchOutcome {
    UpToDate,
    Staged(ContentManifest),
}

/// Downloads and stages remote releases.
pub struct UpdateLoader {
    root: PathBuf,
    transport: Arc<dyn UpdateTransport>,
    manifests: ManifestStore,
    bus: EventBus,
    in_flight: Arc<AtomicBool>,
}

impl UpdateLoader {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<dyn UpdateTransport>, bus: EventBus) -> Self {
        Self {
            root: root.into(),
            transport,
            manifests: ManifestStore,
            bus,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a fetch is currently executing.
    pub fn is_executing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a fetch on a background task. Rejects synchronously with
    /// `AlreadyInFlight` if a fetch is already executing; every other
    /// outcome arrives as a published event.
    pub fn spawn_fetch(
        self: &Arc<Self>,
        config_url: String,
        current_release: String,
    ) -> Result<(), UpdateError> {
        let guard = InFlightGuard::claim(&self.in_flight, OperationKind::Fetch)?;
        let loader = Arc::clone(self);
        tokio::spawn(async move {
            loader.run_fetch(guard, &config_url, &current_release).await;
        });
        Ok(())
    }

    /// Run one fetch to completion, publishing the outcome. The guard is
    /// held for the whole operation and released on drop.
    async fn run_fetch(&self, _guard: InFlightGuard, config_url: &str, current_release: &str) {
        match self.fetch_inner(config_url, current_release).await {
            Ok(FetchOutcome::UpToDate) => {
                info!("nothing to update; {current_release} is the latest release");
                self.bus.publish(UpdateEvent::NothingToUpdate);
            }
            Ok(FetchOutcome::Staged(manifest)) => {
                info!("release {} staged and ready to install", manifest.release);
                self.bus.publish(UpdateEvent::UpdateReadyToInstall(manifest));
            }
            Err(e) => {
                warn!("update fetch failed: {e}");
                self.bus.publish(UpdateEvent::UpdateDownloadFailed(e));
            }
        }
    }

    async fn fetch_inner(
        &self,
        config_url: &str,
        current_release: &str,
    ) -> Result<FetchOutcome, UpdateError> {
        let remote = self.transport.fetch_manifest(config_url).await?;
        safe_release_id(&remote.release)?;
        debug!("remote manifest names release {}", remote.release);

        // The active release's own manifest missing or unreadable is a
        // corruption signal, not a transient error.
        let local_dir = FileLayout::for_release(&self.root, current_release).content_dir();
        let local = self
            .manifests
            .load_from(&local_dir)
            .map_err(|_| UpdateError::LocalManifestNotFound)?;

        if remote.release == local.release {
            return Ok(FetchOutcome::UpToDate);
        }

        self.stage_release(&remote, current_release).await?;
        Ok(FetchOutcome::Staged(remote))
    }

    /// Download the new release into a fresh staging directory. Content
    /// identical to the active release is copied locally instead of
    /// re-downloaded. The manifest pair is written last: its presence
    /// marks the staging as complete.
    async fn stage_release(
        &self,
        remote: &ContentManifest,
        current_release: &str,
    ) -> Result<(), UpdateError> {
        let staging = FileLayout::for_release(&self.root, &remote.release).staging_dir();
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| UpdateError::LayoutError {
                reason: format!("failed to clear staging: {e}"),
            })?;
        }
        std::fs::create_dir_all(&staging).map_err(|e| UpdateError::LayoutError {
            reason: format!("failed to create staging: {e}"),
        })?;

        let index = self.transport.fetch_content_index(&remote.content_url).await?;
        let current_content = FileLayout::for_release(&self.root, current_release).content_dir();

        let mut downloaded = 0usize;
        let mut reused = 0usize;
        for entry in &index.files {
            let relative = safe_relative_path(&entry.file)?;
            let dest = staging.join(&relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| UpdateError::LayoutError {
                    reason: e.to_string(),
                })?;
            }

            let local = current_content.join(&relative);
            if file_sha256_hex(&local).as_deref() == Some(entry.hash.as_str()) {
                std::fs::copy(&local, &dest).map_err(|e| UpdateError::LayoutError {
                    reason: e.to_string(),
                })?;
                reused += 1;
                continue;
            }

            let bytes = self
                .transport
                .fetch_content_file(&remote.content_url, &entry.file)
                .await?;
            if sha256_hex(&bytes) != entry.hash {
                return Err(UpdateError::ChecksumMismatch {
                    file: entry.file.clone(),
                });
            }
            std::fs::write(&dest, &bytes).map_err(|e| UpdateError::LayoutError {
                reason: e.to_string(),
            })?;
            downloaded += 1;
        }

        // Completion markers. An interrupted staging has no manifest and
        // can never be mistaken for a complete one.
        self.write_completion_markers(&staging, remote, &index)?;

        info!(
            "staged release {}: {downloaded} downloaded, {reused} reused",
            remote.release
        );
        Ok(())
    }

    fn write_completion_markers(
        &self,
        staging: &Path,
        remote: &ContentManifest,
        index: &ContentIndex,
    ) -> Result<(), UpdateError> {
        self.manifests.save_index_to(staging, index)?;
        self.manifests.save_to(staging, remote)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_claim_rejects_a_second_claim_and_clears_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));

        let guard = InFlightGuard::claim(&flag, OperationKind::Fetch).unwrap();
        let err = InFlightGuard::claim(&flag, OperationKind::Fetch).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::AlreadyInFlight {
                operation: OperationKind::Fetch
            }
        ));

        drop(guard);
        assert!(InFlightGuard::claim(&flag, OperationKind::Fetch).is_ok());
    }

    #[test]
    fn unsafe_index_paths_are_rejected() {
        assert!(safe_relative_path("js/app.js").is_ok());
        assert!(safe_relative_path("../outside").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("").is_err());
    }

    #[test]
    fn hostile_release_identifiers_are_rejected() {
        assert!(safe_release_id("2.0").is_ok());
        assert!(safe_release_id("2024-06-01_build-4").is_ok());
        assert!(safe_release_id("../../pwn").is_err());
        assert!(safe_release_id("a/b").is_err());
        assert!(safe_release_id("/abs").is_err());
        assert!(safe_release_id("..").is_err());
        assert!(safe_release_id(".").is_err());
        assert!(safe_release_id("").is_err());
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
