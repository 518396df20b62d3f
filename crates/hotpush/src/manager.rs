//! Lifecycle manager: the orchestrator that owns policy decisions and
//! reacts to worker events.
//!
//! Logical phases:
//!
//! ```text
//! Bootstrapping -> Idle -> Fetching -> Idle | ReadyToInstall
//!                                            -> Installing -> Idle
//! RollingBack reachable from any post-bootstrap phase on a corruption
//! signal.
//! ```
//!
//! The manager's `run()` event loop is the sole ledger mutator, so all
//! ledger transitions are totally ordered. Content reloads are never
//! performed inline: the manager pushes a request onto an explicit queue
//! the host drains on its primary execution context.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bootstrap::BootstrapInstaller;
use crate::config::{PolicyConfig, PolicyOverrides};
use crate::error::UpdateError;
use crate::events::{EventBus, UpdateEvent};
use crate::installer::UpdateInstaller;
use crate::layout::{self, FileLayout};
use crate::ledger::{LedgerStore, ReleaseLedger};
use crate::loader::UpdateLoader;
use crate::manifest::{ManifestStore, UpdateTiming};
use crate::rollback::{RollbackAction, RollbackController};
use crate::transport::{HttpTransport, UpdateTransport};

/// Name of the ledger document beneath the storage root.
pub const LEDGER_FILE: &str = "ledger.json";

/// Logical phase of the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    Idle,
    Fetching,
    ReadyToInstall,
    Installing,
    RollingBack,
}

/// One-time setup supplied by the host shell.
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Static update policy.
    pub policy: PolicyConfig,
    /// Writable storage root for releases and the ledger.
    pub storage_root: PathBuf,
    /// Read-only bundled content shipped inside the application package.
    /// Must contain a release manifest.
    pub bundle_dir: PathBuf,
    /// Build identifier of the running host application.
    pub host_build_id: i64,
}

impl UpdateSettings {
    /// Build settings from the host's raw policy JSON. Fails with
    /// `ConfigInvalid` if the policy cannot be parsed.
    pub fn from_policy_json(
        raw_policy: &str,
        storage_root: impl Into<PathBuf>,
        bundle_dir: impl Into<PathBuf>,
        host_build_id: i64,
    ) -> Result<Self, UpdateError> {
        Ok(Self {
            policy: PolicyConfig::from_json(raw_policy)?,
            storage_root: storage_root.into(),
            bundle_dir: bundle_dir.into(),
            host_build_id,
        })
    }
}

/// Deferred request to rebind the host's content renderer to the active
/// release. Delivered on the host's primary execution context, never
/// inline with event handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    /// Content directory of the release that just became active.
    pub content_dir: PathBuf,
}

/// The release lifecycle orchestrator.
pub struct UpdateManager {
    policy: RwLock<PolicyConfig>,
    root: PathBuf,
    host_build_id: i64,
    bundled_release: String,
    ledger: Mutex<ReleaseLedger>,
    store: LedgerStore,
    manifests: ManifestStore,
    loader: Arc<UpdateLoader>,
    installer: Arc<UpdateInstaller>,
    bootstrap: Arc<BootstrapInstaller>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<UpdateEvent>>>,
    reload_tx: mpsc::UnboundedSender<ReloadRequest>,
    status_tx: Mutex<Option<mpsc::UnboundedSender<UpdateEvent>>>,
    pending_fetch: Mutex<Option<oneshot::Sender<UpdateEvent>>>,
    pending_install: Mutex<Option<oneshot::Sender<UpdateEvent>>>,
    phase: Mutex<Phase>,
    rollback: RollbackController,
}

impl UpdateManager {
    /// One-time setup with the production HTTP transport.
    pub fn initialize_with_http(
        settings: UpdateSettings,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ReloadRequest>), UpdateError> {
        Self::initialize(settings, Arc::new(HttpTransport::new()))
    }

    /// One-time setup. Loads the persisted ledger (or defaults it on
    /// first run), reads the bundled release manifest, and prunes stale
    /// release directories. The returned receiver carries deferred
    /// content-reload requests for the host's primary context.
    pub fn initialize(
        settings: UpdateSettings,
        transport: Arc<dyn UpdateTransport>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ReloadRequest>), UpdateError> {
        let manifests = ManifestStore;
        let bundled_release = manifests
            .load_from(&settings.bundle_dir)
            .map_err(|e| UpdateError::ConfigInvalid {
                reason: format!("bundled manifest unreadable: {e}"),
            })?
            .release;

        let store = LedgerStore::new(settings.storage_root.join(LEDGER_FILE));
        let ledger = match store.load() {
            Ok(ledger) => ledger,
            Err(UpdateError::LedgerNotFound) => {
                info!("no persisted ledger, starting from bundled release {bundled_release}");
                ReleaseLedger::new_default(&bundled_release)
            }
            Err(e) => return Err(e),
        };
        info!("currently running release {}", ledger.current_release);

        let keep: Vec<&str> = [
            Some(ledger.current_release.as_str()),
            ledger.previous_release.as_deref(),
            ledger.ready_to_install_release.as_deref(),
            Some(bundled_release.as_str()),
        ]
        .into_iter()
        .flatten()
        .collect();
        layout::remove_stale_releases(&settings.storage_root, &keep);

        let (bus, events_rx) = EventBus::new();
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();

        let loader = Arc::new(UpdateLoader::new(
            &settings.storage_root,
            transport,
            bus.clone(),
        ));
        let installer = Arc::new(UpdateInstaller::new(&settings.storage_root, bus.clone()));
        let bootstrap = Arc::new(BootstrapInstaller::new(
            &settings.storage_root,
            &settings.bundle_dir,
            bus,
        ));

        let manager = Arc::new(Self {
            policy: RwLock::new(settings.policy),
            root: settings.storage_root,
            host_build_id: settings.host_build_id,
            bundled_release,
            ledger: Mutex::new(ledger),
            store,
            manifests,
            loader,
            installer,
            bootstrap,
            events_rx: Mutex::new(Some(events_rx)),
            reload_tx,
            status_tx: Mutex::new(None),
            pending_fetch: Mutex::new(None),
            pending_install: Mutex::new(None),
            phase: Mutex::new(Phase::Idle),
            rollback: RollbackController,
        });
        Ok((manager, reload_rx))
    }

    /// Register the persistent status subscriber. Every lifecycle event
    /// is forwarded to the returned receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<UpdateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.status_tx.lock().expect("status lock poisoned") = Some(tx);
        rx
    }

    /// Current phase of the lifecycle state machine.
    pub fn phase(&self) -> Phase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    /// Snapshot of the ledger for status reporting.
    pub fn ledger_snapshot(&self) -> ReleaseLedger {
        self.ledger.lock().expect("ledger lock poisoned").clone()
    }

    /// Whether a fetch or install is currently executing.
    pub fn is_busy(&self) -> bool {
        self.operation_in_flight()
    }

    /// Merge runtime policy overrides supplied by the external caller.
    pub fn set_policy_overrides(&self, overrides: &PolicyOverrides) {
        self.policy
            .write()
            .expect("policy lock poisoned")
            .merge(overrides);
    }

    // ------------------------------------------------------------------
    // Host lifecycle hooks
    // ------------------------------------------------------------------

    /// Host application started. Bootstraps the writable content area if
    /// needed; otherwise installs any staged release (start timing) or
    /// kicks off the startup fetch.
    pub fn on_host_started(&self) {
        if !self.ready_for_work() {
            self.begin_bootstrap();
            return;
        }
        self.set_phase(Phase::Idle);

        let policy = self.policy.read().expect("policy lock poisoned").clone();
        let (staged, current) = {
            let ledger = self.ledger.lock().expect("ledger lock poisoned");
            (
                ledger.ready_to_install_release.clone(),
                ledger.current_release.clone(),
            )
        };

        if self.operation_in_flight() {
            return;
        }
        if policy.auto_install && staged.is_some() {
            self.trigger_install();
        } else if policy.auto_download {
            debug!("startup auto-check for release {current}");
            self.trigger_fetch();
        }
    }

    /// Host application resumed from background. Installs a staged
    /// release whose timing is `Immediate` or `OnNextResume`.
    pub fn on_host_resumed(&self) {
        if !self.ready_for_work() {
            return;
        }
        let policy = self.policy.read().expect("policy lock poisoned").clone();
        if !policy.auto_install || self.operation_in_flight() {
            return;
        }
        let staged = self
            .ledger
            .lock()
            .expect("ledger lock poisoned")
            .ready_to_install_release
            .clone();
        let Some(staged) = staged else { return };

        // Read timing from the staged copy; if its manifest is gone the
        // install attempt itself will raise the corruption signal.
        let Some(manifest) = self.staged_manifest(&staged) else {
            return;
        };
        if matches!(
            manifest.update,
            UpdateTiming::Immediate | UpdateTiming::OnNextResume
        ) {
            self.trigger_install();
        }
    }

    /// Host application is stopping. Persists the ledger; in-flight
    /// operations run to completion and report on the event channel.
    pub fn on_host_stopped(&self) {
        let ledger = self.ledger.lock().expect("ledger lock poisoned").clone();
        if let Err(e) = self.store.save(&ledger) {
            warn!("failed to persist ledger on stop: {e}");
        }
        debug!("host stopped in phase {:?}", self.phase());
    }

    // ------------------------------------------------------------------
    // Explicit requests
    // ------------------------------------------------------------------

    /// Request an update fetch. Returns immediately; the outcome event
    /// arrives on the returned receiver (and on the status stream).
    pub fn request_fetch(&self) -> Result<oneshot::Receiver<UpdateEvent>, UpdateError> {
        if !self.ready_for_work() {
            return Err(UpdateError::AssetsNotInstalled);
        }
        let config_url = self
            .policy
            .read()
            .expect("policy lock poisoned")
            .config_url
            .clone();
        let current = self
            .ledger
            .lock()
            .expect("ledger lock poisoned")
            .current_release
            .clone();

        // The pending slot is held across the spawn, so a fast worker
        // blocks in notify() until the caller's sender is registered.
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending_fetch.lock().expect("pending lock poisoned");
        let prior_phase = self.phase();
        self.set_phase(Phase::Fetching);
        if let Err(e) = self.loader.spawn_fetch(config_url, current) {
            self.set_phase(prior_phase);
            return Err(e);
        }
        *pending = Some(tx);
        Ok(rx)
    }

    /// Request installation of the staged release. Returns immediately;
    /// the outcome event arrives on the returned receiver. With nothing
    /// staged the outcome is the `NothingToInstall` event.
    pub fn request_install(&self) -> Result<oneshot::Receiver<UpdateEvent>, UpdateError> {
        if !self.ready_for_work() {
            return Err(UpdateError::AssetsNotInstalled);
        }
        let (staged, current) = {
            let ledger = self.ledger.lock().expect("ledger lock poisoned");
            (
                ledger.ready_to_install_release.clone(),
                ledger.current_release.clone(),
            )
        };

        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending_install.lock().expect("pending lock poisoned");
        let prior_phase = self.phase();
        self.set_phase(Phase::Installing);
        if let Err(e) = self.installer.spawn_install(staged, current) {
            self.set_phase(prior_phase);
            return Err(e);
        }
        *pending = Some(tx);
        Ok(rx)
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Drain lifecycle events until every bus sender is gone. The sole
    /// ledger mutator; call it once, on one task. A second call returns
    /// immediately without touching the event stream.
    pub async fn run(&self) {
        let rx = self.events_rx.lock().expect("events lock poisoned").take();
        let Some(mut rx) = rx else {
            warn!("event loop is already running");
            return;
        };
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: UpdateEvent) {
        debug!("handling event: {}", event.name());
        match &event {
            UpdateEvent::AssetsInstalled => self.on_assets_installed(),
            UpdateEvent::AssetsInstallationFailed(e) => {
                // Nothing more to do automatically: the application keeps
                // serving its bundled read-only content.
                warn!("continuing with bundled content only: {e}");
            }
            UpdateEvent::UpdateReadyToInstall(manifest) => {
                {
                    let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
                    ledger.ready_to_install_release = Some(manifest.release.clone());
                    self.persist(&ledger);
                }
                self.set_phase(Phase::ReadyToInstall);
            }
            UpdateEvent::NothingToUpdate => self.set_phase(Phase::Idle),
            UpdateEvent::UpdateDownloadFailed(_) | UpdateEvent::UpdateInstallationFailed(_) => {
                self.set_phase(Phase::Idle);
            }
            UpdateEvent::UpdateInstalled(manifest) => {
                let content_dir = {
                    let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
                    ledger.record_install(&manifest.release);
                    self.persist(&ledger);
                    FileLayout::for_release(&self.root, &ledger.current_release).content_dir()
                };
                self.schedule_reload(content_dir);
                self.set_phase(Phase::Idle);
            }
            UpdateEvent::NothingToInstall => self.set_phase(Phase::Idle),
        }

        self.notify(&event);

        // Post-notification policy actions, matching the order callers
        // observe: state recorded, callbacks fired, then chained work.
        match &event {
            UpdateEvent::AssetsInstalled => {
                let policy = self.policy.read().expect("policy lock poisoned").clone();
                if policy.auto_download && !self.operation_in_flight() {
                    self.trigger_fetch();
                }
            }
            UpdateEvent::UpdateReadyToInstall(manifest) => {
                let policy = self.policy.read().expect("policy lock poisoned").clone();
                if policy.auto_install && manifest.update == UpdateTiming::Immediate {
                    self.trigger_install();
                }
            }
            UpdateEvent::UpdateDownloadFailed(e) | UpdateEvent::UpdateInstallationFailed(e) => {
                if e.is_corruption_signal() {
                    self.rollback_now();
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// The writable content area is usable: bootstrap completed, the host
    /// application was not upgraded since, and the active release's
    /// content directory exists.
    fn ready_for_work(&self) -> bool {
        let ledger = self.ledger.lock().expect("ledger lock poisoned");
        ledger.assets_bootstrapped
            && ledger.host_build_id == self.host_build_id
            && FileLayout::for_release(&self.root, &ledger.current_release)
                .content_dir()
                .is_dir()
    }

    fn operation_in_flight(&self) -> bool {
        self.loader.is_executing() || self.installer.is_installing()
    }

    fn begin_bootstrap(&self) {
        self.set_phase(Phase::Bootstrapping);
        {
            let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
            if ledger.assets_bootstrapped {
                // Host app upgraded externally; the writable copy is stale.
                info!("host application changed, reinstalling bundled content");
                ledger.assets_bootstrapped = false;
                self.persist(&ledger);
            }
        }
        self.bootstrap.spawn_install(self.bundled_release.clone());
    }

    fn on_assets_installed(&self) {
        let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
        ledger.current_release = self.bundled_release.clone();
        ledger.previous_release = None;
        ledger.ready_to_install_release = None;
        ledger.assets_bootstrapped = true;
        ledger.host_build_id = self.host_build_id;
        self.persist(&ledger);
        drop(ledger);
        self.set_phase(Phase::Idle);
    }

    fn trigger_fetch(&self) {
        let config_url = self
            .policy
            .read()
            .expect("policy lock poisoned")
            .config_url
            .clone();
        let current = self
            .ledger
            .lock()
            .expect("ledger lock poisoned")
            .current_release
            .clone();
        let prior_phase = self.phase();
        self.set_phase(Phase::Fetching);
        if let Err(e) = self.loader.spawn_fetch(config_url, current) {
            self.set_phase(prior_phase);
            debug!("auto-fetch not started: {e}");
        }
    }

    fn trigger_install(&self) {
        let (staged, current) = {
            let ledger = self.ledger.lock().expect("ledger lock poisoned");
            (
                ledger.ready_to_install_release.clone(),
                ledger.current_release.clone(),
            )
        };
        let prior_phase = self.phase();
        self.set_phase(Phase::Installing);
        if let Err(e) = self.installer.spawn_install(staged, current) {
            self.set_phase(prior_phase);
            debug!("auto-install not started: {e}");
        }
    }

    fn rollback_now(&self) {
        self.set_phase(Phase::RollingBack);
        let action = {
            let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
            let action = self.rollback.rollback(&mut ledger);
            self.persist(&ledger);
            action
        };
        match action {
            RollbackAction::RewoundTo(release) => {
                match layout::switch_active_release(&self.root, &release) {
                    Ok(()) => {
                        let content_dir =
                            FileLayout::for_release(&self.root, &release).content_dir();
                        self.schedule_reload(content_dir);
                        self.set_phase(Phase::Idle);
                    }
                    Err(e) => {
                        // The previous release is gone as well; fall all
                        // the way back to bundled content.
                        warn!("rollback target unusable ({e}), reinstalling bundled content");
                        self.begin_bootstrap();
                    }
                }
            }
            RollbackAction::BootstrapRequired => self.begin_bootstrap(),
        }
    }

    /// Load the staged release's manifest from its staging directory, or
    /// from its content directory if staging was already finalized.
    fn staged_manifest(&self, staged: &str) -> Option<crate::manifest::ContentManifest> {
        let staged_layout = FileLayout::for_release(&self.root, staged);
        self.manifests
            .load_from(&staged_layout.staging_dir())
            .or_else(|_| self.manifests.load_from(&staged_layout.content_dir()))
            .ok()
    }

    fn schedule_reload(&self, content_dir: PathBuf) {
        if self.reload_tx.send(ReloadRequest { content_dir }).is_err() {
            debug!("no reload consumer registered");
        }
    }

    fn persist(&self, ledger: &ReleaseLedger) {
        if let Err(e) = self.store.save(ledger) {
            error!("failed to persist ledger: {e}");
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().expect("phase lock poisoned") = phase;
    }

    /// Deliver the event to the waiting one-shot caller (if any) and to
    /// the persistent status subscriber.
    fn notify(&self, event: &UpdateEvent) {
        let pending = match event {
            UpdateEvent::UpdateReadyToInstall(_)
            | UpdateEvent::NothingToUpdate
            | UpdateEvent::UpdateDownloadFailed(_) => Some(&self.pending_fetch),
            UpdateEvent::UpdateInstalled(_)
            | UpdateEvent::UpdateInstallationFailed(_)
            | UpdateEvent::NothingToInstall => Some(&self.pending_install),
            _ => None,
        };
        if let Some(pending) = pending {
            if let Some(tx) = pending.lock().expect("pending lock poisoned").take() {
                let _ = tx.send(event.clone());
            }
        }

        let mut status = self.status_tx.lock().expect("status lock poisoned");
        if let Some(tx) = status.as_ref() {
            if tx.send(event.clone()).is_err() {
                // Subscriber went away; drop the sender.
                *status = None;
            }
        }
    }
}
