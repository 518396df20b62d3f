//! Error taxonomy for the update lifecycle.
//!
//! Three classes of failure matter to callers:
//! - transient transport failures (retry by re-requesting a fetch)
//! - corruption signals (the active or staged release's own files are
//!   missing; recovered locally via rollback)
//! - local storage faults (surfaced, never auto-retried)

use std::fmt;

/// Operation kinds gated by the single-flight guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Update fetch/download.
    Fetch,
    /// Update installation.
    Install,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Fetch => write!(f, "fetch"),
            OperationKind::Install => write!(f, "install"),
        }
    }
}

/// All errors produced by the update lifecycle components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// Another operation of the same kind is already executing.
    /// A rejection, not a failure: re-request after the in-flight
    /// operation reports its outcome.
    #[error("another {operation} operation is already in flight")]
    AlreadyInFlight { operation: OperationKind },

    /// Remote manifest could not be retrieved (network/transport).
    #[error("remote manifest unreachable: {reason}")]
    RemoteManifestUnreachable { reason: String },

    /// Remote content file could not be retrieved (network/transport).
    #[error("remote content unreachable: {reason}")]
    ContentUnreachable { reason: String },

    /// The active release's own manifest is missing. Corruption signal:
    /// the release directory we are supposedly running from is broken.
    #[error("manifest for the active release not found")]
    LocalManifestNotFound,

    /// The staged release's manifest is missing. Corruption signal.
    #[error("manifest for the staged release not found")]
    StagedManifestNotFound,

    /// No manifest file exists in the given directory.
    #[error("no manifest in {dir}")]
    ManifestNotFound { dir: String },

    /// A manifest file exists but cannot be parsed.
    #[error("manifest corrupt: {reason}")]
    ManifestCorrupt { reason: String },

    /// A downloaded file did not match its expected hash.
    #[error("checksum mismatch for {file}")]
    ChecksumMismatch { file: String },

    /// Release directory layout fault (missing target, failed switch).
    #[error("layout error: {reason}")]
    LayoutError { reason: String },

    /// The durable ledger could not be read or written.
    #[error("persistence error: {reason}")]
    PersistenceError { reason: String },

    /// No ledger exists yet (first run). Caller supplies defaults.
    #[error("no persisted ledger found")]
    LedgerNotFound,

    /// First-run asset bootstrap failed. Fatal for the session; the
    /// application keeps serving its bundled read-only content.
    #[error("asset bootstrap failed: {reason}")]
    BootstrapFailed { reason: String },

    /// Operation requested before the writable content area exists.
    #[error("assets are not yet installed")]
    AssetsNotInstalled,

    /// Host policy configuration could not be parsed.
    #[error("invalid policy config: {reason}")]
    ConfigInvalid { reason: String },
}

impl UpdateError {
    /// True for errors indicating the active or staged release's own
    /// directory is missing or unreadable. These trigger rollback.
    /// Transport failures never do.
    pub fn is_corruption_signal(&self) -> bool {
        matches!(
            self,
            UpdateError::LocalManifestNotFound | UpdateError::StagedManifestNotFound
        )
    }

    /// True for network-class failures that a later re-request may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateError::RemoteManifestUnreachable { .. }
                | UpdateError::ContentUnreachable { .. }
                | UpdateError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_signals_are_exactly_the_two_manifest_not_found_errors() {
        assert!(UpdateError::LocalManifestNotFound.is_corruption_signal());
        assert!(UpdateError::StagedManifestNotFound.is_corruption_signal());

        assert!(!UpdateError::RemoteManifestUnreachable {
            reason: "offline".into()
        }
        .is_corruption_signal());
        assert!(!UpdateError::ManifestCorrupt {
            reason: "bad json".into()
        }
        .is_corruption_signal());
        assert!(!UpdateError::LayoutError {
            reason: "missing dir".into()
        }
        .is_corruption_signal());
    }

    #[test]
    fn transient_errors_do_not_overlap_corruption() {
        let transient = UpdateError::RemoteManifestUnreachable {
            reason: "timeout".into(),
        };
        assert!(transient.is_transient());
        assert!(!transient.is_corruption_signal());
    }

    #[test]
    fn display_names_the_in_flight_operation() {
        let err = UpdateError::AlreadyInFlight {
            operation: OperationKind::Fetch,
        };
        assert_eq!(err.to_string(), "another fetch operation is already in flight");
    }
}
