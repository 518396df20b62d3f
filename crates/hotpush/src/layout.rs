//! On-disk layout of release directories and the atomic active switch.
//!
//! ```text
//! <root>/
//!   ledger.json                  durable release ledger
//!   releases/<id>/content/       immutable content of release <id>
//!   releases/<id>/staging/       in-progress download for release <id>
//!   current -> releases/<id>/content
//! ```
//!
//! `current` is a symlink replaced via symlink-to-temp-name plus rename,
//! so a concurrent reader resolves either the old or the new target,
//! never a half-switched state. The content directories themselves are
//! immutable once a release is live; the switch is the sole
//! mutual-exclusion mechanism between the downloader, the installer, and
//! the running application's content renderer.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::UpdateError;

/// Name of the active-content symlink beneath the storage root.
pub const CURRENT_LINK: &str = "current";

/// Subdirectory holding one directory per release.
pub const RELEASES_DIR: &str = "releases";

/// Directory paths for one release's content and staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    root: PathBuf,
    release: String,
}

impl FileLayout {
    /// Layout for the given release beneath the storage root.
    pub fn for_release(root: impl Into<PathBuf>, release: &str) -> Self {
        Self {
            root: root.into(),
            release: release.to_string(),
        }
    }

    pub fn release(&self) -> &str {
        &self.release
    }

    /// `<root>/releases/<id>`
    pub fn release_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR).join(&self.release)
    }

    /// `<root>/releases/<id>/content`
    pub fn content_dir(&self) -> PathBuf {
        self.release_dir().join("content")
    }

    /// `<root>/releases/<id>/staging`
    pub fn staging_dir(&self) -> PathBuf {
        self.release_dir().join("staging")
    }
}

/// Path of the active-content symlink.
pub fn current_link(root: &Path) -> PathBuf {
    root.join(CURRENT_LINK)
}

/// Resolve the release content directory the `current` link points at.
pub fn active_content_dir(root: &Path) -> Option<PathBuf> {
    fs::read_link(current_link(root)).ok()
}

/// Atomically rebind `<root>/current` to the content directory of the
/// given release. Fails with `LayoutError` if that directory does not
/// exist. Readers see either the old or the new target.
pub fn switch_active_release(root: &Path, release: &str) -> Result<(), UpdateError> {
    let target = FileLayout::for_release(root, release).content_dir();
    if !target.is_dir() {
        return Err(UpdateError::LayoutError {
            reason: format!("release content missing: {}", target.display()),
        });
    }

    let link = current_link(root);
    let temp_link = root.join(".current.tmp");

    // A leftover temp link from an interrupted switch is harmless; replace it.
    let _ = fs::remove_file(&temp_link);

    std::os::unix::fs::symlink(&target, &temp_link).map_err(|e| UpdateError::LayoutError {
        reason: format!("failed to prepare switch: {e}"),
    })?;
    fs::rename(&temp_link, &link).map_err(|e| UpdateError::LayoutError {
        reason: format!("failed to switch active release: {e}"),
    })?;

    debug!("active release switched to {release}");
    Ok(())
}

/// Remove release directories for releases not in the keep set. Run at
/// startup so failed or superseded downloads do not accumulate.
pub fn remove_stale_releases(root: &Path, keep: &[&str]) {
    let releases_dir = root.join(RELEASES_DIR);
    let entries = match fs::read_dir(&releases_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if keep.contains(&name) {
            continue;
        }
        debug!("removing stale release directory: {name}");
        if let Err(e) = fs::remove_dir_all(entry.path()) {
            warn!("failed to remove stale release {name}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_release(root: &Path, release: &str) -> PathBuf {
        let content = FileLayout::for_release(root, release).content_dir();
        fs::create_dir_all(&content).unwrap();
        fs::write(content.join("index.html"), release).unwrap();
        content
    }

    #[test]
    fn layout_paths_derive_from_release_id() {
        let layout = FileLayout::for_release("/data/hotpush", "2.0");
        assert_eq!(
            layout.content_dir(),
            PathBuf::from("/data/hotpush/releases/2.0/content")
        );
        assert_eq!(
            layout.staging_dir(),
            PathBuf::from("/data/hotpush/releases/2.0/staging")
        );
    }

    #[test]
    fn switch_points_current_at_the_release_content() {
        let temp = TempDir::new().unwrap();
        let content = make_release(temp.path(), "1.0");

        switch_active_release(temp.path(), "1.0").unwrap();
        assert_eq!(active_content_dir(temp.path()), Some(content));
    }

    #[test]
    fn switch_replaces_an_existing_link_atomically() {
        let temp = TempDir::new().unwrap();
        make_release(temp.path(), "1.0");
        let content_2 = make_release(temp.path(), "2.0");

        switch_active_release(temp.path(), "1.0").unwrap();
        switch_active_release(temp.path(), "2.0").unwrap();

        assert_eq!(active_content_dir(temp.path()), Some(content_2));
        // No temp link is left behind.
        assert!(!temp.path().join(".current.tmp").exists());
    }

    #[test]
    fn switch_to_missing_release_fails_and_keeps_old_target() {
        let temp = TempDir::new().unwrap();
        let content_1 = make_release(temp.path(), "1.0");
        switch_active_release(temp.path(), "1.0").unwrap();

        let err = switch_active_release(temp.path(), "9.9").unwrap_err();
        assert!(matches!(err, UpdateError::LayoutError { .. }));

        // Old release remains active and fully intact.
        assert_eq!(active_content_dir(temp.path()), Some(content_1.clone()));
        assert_eq!(
            fs::read_to_string(content_1.join("index.html")).unwrap(),
            "1.0"
        );
    }

    #[test]
    fn stale_releases_are_pruned_but_kept_ones_survive() {
        let temp = TempDir::new().unwrap();
        make_release(temp.path(), "1.0");
        make_release(temp.path(), "2.0");
        make_release(temp.path(), "0.9");

        remove_stale_releases(temp.path(), &["1.0", "2.0"]);

        let releases = temp.path().join(RELEASES_DIR);
        assert!(releases.join("1.0").exists());
        assert!(releases.join("2.0").exists());
        assert!(!releases.join("0.9").exists());
    }

    #[test]
    fn prune_on_missing_releases_dir_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        remove_stale_releases(temp.path(), &["1.0"]);
    }
}
