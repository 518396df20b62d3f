//! Rollback decisions for corruption-class failures.
//!
//! Only the two manifest-not-found corruption signals reach this code;
//! transport failures never do. The controller decides and rewinds the
//! in-memory ledger; the manager applies the side effects (persist,
//! layout switch, reload scheduling, or bootstrap re-run).

use tracing::info;

use crate::ledger::ReleaseLedger;

/// What recovery the lifecycle manager must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    /// The ledger was rewound; switch the layout to this release and
    /// schedule a content reload.
    RewoundTo(String),
    /// No previous release exists; re-run the bootstrap installer for a
    /// full reset to bundled content.
    BootstrapRequired,
}

/// Decides between rewinding to the previous release and a full reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackController;

impl RollbackController {
    /// Rewind the ledger to the previous release if one exists. Safe to
    /// call repeatedly: once `previous_release` is empty every further
    /// call reports `BootstrapRequired`.
    pub fn rollback(&self, ledger: &mut ReleaseLedger) -> RollbackAction {
        match ledger.rewind() {
            Some(previous) => {
                info!("active release is corrupted, rolling back to {previous}");
                RollbackAction::RewoundTo(previous)
            }
            None => {
                info!("active release is corrupted and no previous release exists, bootstrap required");
                ledger.ready_to_install_release = None;
                RollbackAction::BootstrapRequired
            }
        }
    }
}
