//! Release manifests and the per-release content index.
//!
//! Each release directory carries two files:
//! - `hotpush.json` — the release manifest: release id, update timing,
//!   content URL, optional store-upgrade URL.
//! - `hotpush.manifest` — the content index: relative path + sha256 for
//!   every content file. Written into a staging directory only after all
//!   content downloaded successfully, so its presence marks a complete
//!   staging.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// File name of the release manifest inside a release directory.
pub const MANIFEST_FILE: &str = "hotpush.json";

/// File name of the content index inside a release directory.
pub const CONTENT_INDEX_FILE: &str = "hotpush.manifest";

/// When a staged release should be activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTiming {
    /// Install as soon as the download completes.
    #[serde(rename = "now")]
    Immediate,
    /// Install when the host application resumes from background.
    #[serde(rename = "resume")]
    OnNextResume,
    /// Install on the next host application start.
    #[serde(rename = "start")]
    OnNextStart,
}

impl Default for UpdateTiming {
    fn default() -> Self {
        UpdateTiming::OnNextStart
    }
}

/// Per-release metadata loaded from `hotpush.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentManifest {
    /// Release identifier. Opaque, immutable once assigned.
    pub release: String,
    /// When a staged copy of this release should be activated.
    #[serde(default)]
    pub update: UpdateTiming,
    /// Where the content index and content files are served from.
    pub content_url: String,
    /// Optional store page for prompting a full application upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,
}

/// One entry of the content index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFile {
    /// Path relative to the release content root.
    pub file: String,
    /// Lowercase sha256 hex digest of the file bytes.
    pub hash: String,
}

/// The full content index of a release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentIndex {
    pub files: Vec<ContentFile>,
}

/// Loads and writes manifests for release directories. Pure reads; no
/// caching beyond the caller's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestStore;

impl ManifestStore {
    /// Load the release manifest from a directory.
    pub fn load_from(&self, dir: &Path) -> Result<ContentManifest, UpdateError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|_| UpdateError::ManifestNotFound {
            dir: dir.display().to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| UpdateError::ManifestCorrupt {
            reason: e.to_string(),
        })
    }

    /// Write the release manifest into a directory.
    pub fn save_to(&self, dir: &Path, manifest: &ContentManifest) -> Result<(), UpdateError> {
        let raw = serde_json::to_string_pretty(manifest).map_err(|e| {
            UpdateError::ManifestCorrupt {
                reason: e.to_string(),
            }
        })?;
        fs::write(dir.join(MANIFEST_FILE), raw).map_err(|e| UpdateError::PersistenceError {
            reason: e.to_string(),
        })
    }

    /// Load the content index from a directory.
    pub fn load_index_from(&self, dir: &Path) -> Result<ContentIndex, UpdateError> {
        let path = dir.join(CONTENT_INDEX_FILE);
        let raw = fs::read_to_string(&path).map_err(|_| UpdateError::ManifestNotFound {
            dir: dir.display().to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| UpdateError::ManifestCorrupt {
            reason: e.to_string(),
        })
    }

    /// Write the content index into a directory.
    pub fn save_index_to(&self, dir: &Path, index: &ContentIndex) -> Result<(), UpdateError> {
        let raw =
            serde_json::to_string_pretty(index).map_err(|e| UpdateError::ManifestCorrupt {
                reason: e.to_string(),
            })?;
        fs::write(dir.join(CONTENT_INDEX_FILE), raw).map_err(|e| {
            UpdateError::PersistenceError {
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_manifest() -> ContentManifest {
        ContentManifest {
            release: "2024.06.01".to_string(),
            update: UpdateTiming::OnNextResume,
            content_url: "https://cdn.example.com/releases/2024.06.01/".to_string(),
            store_url: None,
        }
    }

    #[test]
    fn manifest_round_trips_through_a_directory() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore;

        store.save_to(temp.path(), &sample_manifest()).unwrap();
        let loaded = store.load_from(temp.path()).unwrap();
        assert_eq!(loaded, sample_manifest());
    }

    #[test]
    fn missing_manifest_reports_not_found() {
        let temp = TempDir::new().unwrap();
        let err = ManifestStore.load_from(temp.path()).unwrap_err();
        assert!(matches!(err, UpdateError::ManifestNotFound { .. }));
    }

    #[test]
    fn unparseable_manifest_reports_corrupt() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(MANIFEST_FILE), "{broken").unwrap();
        let err = ManifestStore.load_from(temp.path()).unwrap_err();
        assert!(matches!(err, UpdateError::ManifestCorrupt { .. }));
    }

    #[test]
    fn update_timing_parses_wire_values() {
        let manifest: ContentManifest = serde_json::from_str(
            r#"{"release": "1.0", "update": "now", "content_url": "https://x/"}"#,
        )
        .unwrap();
        assert_eq!(manifest.update, UpdateTiming::Immediate);

        let manifest: ContentManifest =
            serde_json::from_str(r#"{"release": "1.0", "content_url": "https://x/"}"#).unwrap();
        assert_eq!(manifest.update, UpdateTiming::OnNextStart);
    }

    #[test]
    fn content_index_round_trips() {
        let temp = TempDir::new().unwrap();
        let index = ContentIndex {
            files: vec![
                ContentFile {
                    file: "index.html".to_string(),
                    hash: "aa".repeat(32),
                },
                ContentFile {
                    file: "js/app.js".to_string(),
                    hash: "bb".repeat(32),
                },
            ],
        };
        ManifestStore.save_index_to(temp.path(), &index).unwrap();
        assert_eq!(ManifestStore.load_index_from(temp.path()).unwrap(), index);
    }
}
