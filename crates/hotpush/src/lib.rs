//! hotpush - over-the-air content release manager
//!
//! Delivers content updates to an installed application and switches the
//! running application between content releases without reinstalling the
//! application package.
//!
//! Guarantees:
//! 1. Exactly one release active at any time (atomic symlink switch)
//! 2. Exactly one in-flight operation per kind (single-flight guards)
//! 3. Crash/corruption safety across process restarts (durable ledger,
//!    write-then-rename, staged downloads with completion markers)
//! 4. Deterministic policy-driven transitions (auto-download,
//!    auto-install timing)
//! 5. Rollback to the previous release, or full reset to bundled
//!    content, on corruption signals
//!
//! The host shell embeds [`UpdateManager`], drives it through the
//! lifecycle hooks and explicit requests, subscribes to the event
//! stream, and drains the reload-request queue on its primary execution
//! context.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod installer;
pub mod layout;
pub mod ledger;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod rollback;
pub mod transport;

pub use config::{PolicyConfig, PolicyOverrides};
pub use error::{OperationKind, UpdateError};
pub use events::{EventBus, UpdateEvent};
pub use layout::FileLayout;
pub use ledger::{LedgerStore, ReleaseLedger};
pub use manager::{Phase, ReloadRequest, UpdateManager, UpdateSettings, LEDGER_FILE};
pub use manifest::{ContentFile, ContentIndex, ContentManifest, ManifestStore, UpdateTiming};
pub use rollback::{RollbackAction, RollbackController};
pub use transport::{HttpTransport, UpdateTransport};
