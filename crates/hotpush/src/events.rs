//! Lifecycle events carried between the loader/installer/bootstrap
//! workers and the lifecycle manager.
//!
//! ## Architecture
//!
//! ```text
//! +-----------+     +-------------+     +-------------------+
//! | loader /  | --> | EventBus    | --> | UpdateManager     |
//! | installer |     | (mpsc)      |     | run() event loop  |
//! +-----------+     +-------------+     +-------------------+
//! ```
//!
//! One explicit typed channel owned by the manager; workers hold cloned
//! senders. Delivery is in publish order, and the manager's event loop is
//! the only ledger mutator, so ledger transitions are totally ordered.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::UpdateError;
use crate::manifest::ContentManifest;

/// Outcome events published by the loader, installer, and bootstrap
/// installer. Values are immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// Bundled content was copied into the writable release area.
    AssetsInstalled,
    /// First-run asset copy failed; the application continues to serve
    /// only its bundled read-only content.
    AssetsInstallationFailed(UpdateError),
    /// A new release is fully downloaded and staged.
    UpdateReadyToInstall(ContentManifest),
    /// Remote and local releases are identical.
    NothingToUpdate,
    /// Fetch or download failed.
    UpdateDownloadFailed(UpdateError),
    /// A staged release was activated.
    UpdateInstalled(ContentManifest),
    /// Activation of a staged release failed.
    UpdateInstallationFailed(UpdateError),
    /// Install was requested but no release is staged.
    NothingToInstall,
}

impl UpdateEvent {
    /// Stable name for logging and status reporting.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::AssetsInstalled => "assets_installed",
            UpdateEvent::AssetsInstallationFailed(_) => "assets_installation_failed",
            UpdateEvent::UpdateReadyToInstall(_) => "update_ready_to_install",
            UpdateEvent::NothingToUpdate => "nothing_to_update",
            UpdateEvent::UpdateDownloadFailed(_) => "update_download_failed",
            UpdateEvent::UpdateInstalled(_) => "update_installed",
            UpdateEvent::UpdateInstallationFailed(_) => "update_installation_failed",
            UpdateEvent::NothingToInstall => "nothing_to_install",
        }
    }

    /// The error carried by failure events, if any.
    pub fn error(&self) -> Option<&UpdateError> {
        match self {
            UpdateEvent::AssetsInstallationFailed(e)
            | UpdateEvent::UpdateDownloadFailed(e)
            | UpdateEvent::UpdateInstallationFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Sender half of the lifecycle event channel. Cloned into every worker.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl EventBus {
    /// Create the bus. The receiver goes to the manager's event loop.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpdateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. A closed receiver means the manager is gone;
    /// there is nobody left to act on the event, so the send result is
    /// intentionally ignored.
    pub fn publish(&self, event: UpdateEvent) {
        debug!("publishing event: {}", event.name());
        let _ = self.tx.send(event);
    }
}
