//! Lifecycle of the resident endpoint.
//!
//! `LifecycleManager` is the cross-thread face: RPC dispatch tasks call
//! `bind`, `unbind` and `stop` concurrently. Each call takes the manager's
//! gate, then hands its work to the event loop and waits for the result.
//! `Resident`, which owns the payload and the binding record, only ever
//! runs on the loop thread.
//!
//! Explicit stop, death of the bound client, an artifact change and an
//! unbind the payload does not survive all end in `Resident::terminate`.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use shared::protocol::UnbindOutcome;
use shared::types::{BindFilter, BindRequest, Endpoint, ServiceHandle, ServiceIdentity};
use crate::event_loop::{panic_message, EventLoop};
use crate::mdns::Announcer;
use crate::payload::PrivilegedService;
use crate::peers::{PeerId, PeerLinks};
use crate::registry::ServiceRegistry;
use crate::watcher::ArtifactWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Idle,
    Bound,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// A bind named an identity this endpoint does not serve
    IdentityMismatch,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::IdentityMismatch => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    PeerDied,
    ArtifactChanged,
    Unneeded,
}

/// Sending side of the process exit decision. The first status wins.
#[derive(Clone)]
pub struct ExitSignal(Arc<watch::Sender<Option<ExitStatus>>>);

/// Resolves once an exit status has been decided
pub struct ExitWaiter(watch::Receiver<Option<ExitStatus>>);

pub fn exit_channel() -> (ExitSignal, ExitWaiter) {
    let (tx, rx) = watch::channel(None);
    (ExitSignal(Arc::new(tx)), ExitWaiter(rx))
}

impl ExitSignal {
    /// Returns false if an exit status was already decided
    pub fn fire(&self, status: ExitStatus) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                true
            } else {
                false
            }
        })
    }

    pub fn current(&self) -> Option<ExitStatus> {
        *self.0.borrow()
    }
}

impl ExitWaiter {
    pub async fn wait(&mut self) -> ExitStatus {
        match self.0.wait_for(Option::is_some).await {
            Ok(status) => {
                let status: Option<ExitStatus> = *status;
                status.unwrap_or(ExitStatus::Success)
            }
            Err(_) => ExitStatus::Success,
        }
    }
}

/// Run a payload hook on the loop thread. A panic becomes an error so the
/// caller takes its usual failure path.
fn guarded<R>(hook: &str, run: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "{} hook panicked: {}",
            hook,
            panic_message(payload.as_ref())
        )),
    }
}

/// The single bound client, plus what outlives it
struct BindingRecord {
    /// Linked for death notification whenever Some
    client: Option<PeerId>,
    /// Filter of the first bind; its presence makes later binds rebinds
    filter: BindFilter,
    registered: bool,
}

pub(crate) struct Resident {
    name: String,
    endpoint: Endpoint,
    service: Box<dyn PrivilegedService>,
    state: LifecycleState,
    record: Option<BindingRecord>,
    registry: Arc<dyn ServiceRegistry>,
    peers: Arc<dyn PeerLinks>,
    exit: ExitSignal,
}

impl Resident {
    fn exiting(&self) -> bool {
        self.state == LifecycleState::Stopped || self.exit.current().is_some()
    }

    fn create(&mut self) -> Result<()> {
        if self.state != LifecycleState::Starting {
            return Ok(());
        }
        guarded("create", || self.service.on_create()).context("Payload failed to start")?;
        self.state = LifecycleState::Idle;
        Ok(())
    }

    fn bind(&mut self, caller: PeerId, request: BindRequest) -> Result<ServiceHandle> {
        if self.exiting() || self.state == LifecycleState::Starting {
            anyhow::bail!("endpoint is not accepting binds ({:?})", self.state);
        }

        let newly_linked = self.record.as_ref().and_then(|r| r.client) != Some(caller);
        if newly_linked {
            self.peers
                .link(caller)
                .with_context(|| format!("{} went away before bind completed", caller))?;
        }

        let result = if self.record.is_some() {
            tracing::info!("{} rebind by {}", self.endpoint.identity, caller);
            guarded("rebind", || self.service.on_rebind(&request))
        } else {
            tracing::info!("{} bind by {}", self.endpoint.identity, caller);
            guarded("bind", || self.service.on_bind(&request))
        };

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Bind hook failed for {}: {:#}", caller, e);
                if newly_linked {
                    self.peers.unlink(caller);
                }
                return Err(e.context("payload rejected the bind"));
            }
        };

        match self.record.as_mut() {
            Some(record) => {
                if let Some(previous) = record.client.replace(caller) {
                    if previous != caller {
                        tracing::info!("{} replaces {} as the bound client", caller, previous);
                        self.peers.unlink(previous);
                    }
                }
            }
            None => {
                self.record = Some(BindingRecord {
                    client: Some(caller),
                    filter: request.filter.clone(),
                    registered: false,
                });
            }
        }
        self.state = LifecycleState::Bound;

        Ok(handle)
    }

    fn unbind(&mut self, caller: PeerId) -> UnbindOutcome {
        let Some(record) = self.record.as_mut() else {
            tracing::debug!("Unbind from {} with nothing bound", caller);
            return UnbindOutcome::Ignored;
        };
        if record.client != Some(caller) {
            tracing::warn!("Ignoring unbind from {}: not the bound client", caller);
            return UnbindOutcome::Ignored;
        }

        record.client = None;
        let filter = record.filter.clone();
        self.peers.unlink(caller);
        self.state = LifecycleState::Idle;
        tracing::info!("{} unbind by {}", self.endpoint.identity, caller);

        match guarded("unbind", || self.service.on_unbind(&filter)) {
            Ok(true) => {
                self.publish();
                UnbindOutcome::KeepRunning
            }
            Ok(false) => {
                self.terminate(StopReason::Unneeded);
                UnbindOutcome::Exiting
            }
            Err(e) => {
                tracing::error!("Unbind hook failed, shutting down: {:#}", e);
                self.terminate(StopReason::Unneeded);
                UnbindOutcome::Exiting
            }
        }
    }

    /// Make this instance findable by name for future clients
    fn publish(&mut self) {
        match self.registry.register(&self.name, &self.endpoint) {
            Ok(()) => {
                if let Some(record) = self.record.as_mut() {
                    record.registered = true;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register {}, staying unlisted: {:#}", self.name, e);
            }
        }
    }

    fn peer_died(&mut self, peer: PeerId) {
        let is_client = self.record.as_ref().and_then(|r| r.client) == Some(peer);
        if !is_client {
            tracing::debug!("Ignoring death of {}: not the bound client", peer);
            return;
        }

        // The tracker consumed the link when it reported the death
        if let Some(record) = self.record.as_mut() {
            record.client = None;
        }
        self.terminate(StopReason::PeerDied);
    }

    fn terminate(&mut self, reason: StopReason) {
        if self.exiting() {
            tracing::debug!("Already exiting, ignoring {:?}", reason);
            return;
        }

        if let Some(record) = self.record.take() {
            if let Some(client) = record.client {
                self.peers.unlink(client);
            }
            tracing::debug!("Dropping binding record (registered: {})", record.registered);
        }
        self.state = LifecycleState::Stopped;
        tracing::info!("{} stopping: {:?}", self.endpoint.identity, reason);

        if let Err(e) = guarded("destroy", || self.service.on_destroy()) {
            tracing::error!("Destroy hook failed: {:#}", e);
        }
        self.exit.fire(ExitStatus::Success);
    }
}

/// Owns the resident instance for the life of the process
pub struct LifecycleManager {
    identity: ServiceIdentity,
    endpoint: Endpoint,
    events: EventLoop<Resident>,
    gate: Mutex<()>,
    registry: Arc<dyn ServiceRegistry>,
    announcer: Arc<dyn Announcer>,
    exit: ExitSignal,
    watcher: StdMutex<Option<ArtifactWatcher>>,
}

impl LifecycleManager {
    pub fn new(
        endpoint: Endpoint,
        service: Box<dyn PrivilegedService>,
        registry: Arc<dyn ServiceRegistry>,
        peers: Arc<dyn PeerLinks>,
        announcer: Arc<dyn Announcer>,
        exit: ExitSignal,
    ) -> Result<Self> {
        let identity = endpoint.identity.clone();
        let resident = Resident {
            name: identity.registry_name(),
            endpoint: endpoint.clone(),
            service,
            state: LifecycleState::Starting,
            record: None,
            registry: registry.clone(),
            peers,
            exit: exit.clone(),
        };
        let events = EventLoop::spawn("privd-main", resident)?;

        Ok(Self {
            identity,
            endpoint,
            events,
            gate: Mutex::new(()),
            registry,
            announcer,
            exit,
            watcher: StdMutex::new(None),
        })
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run the payload's create hook: Starting -> Idle
    pub async fn start(&self) -> Result<()> {
        self.events.post_and_wait(Resident::create).await?
    }

    /// Watch the host artifact for the rest of this manager's life
    pub fn watch_artifact(&self, artifact: &Path) -> Result<()> {
        let events = self.events.clone();
        let watcher = ArtifactWatcher::start(artifact, move || {
            if let Err(e) = events.post(|r| r.terminate(StopReason::ArtifactChanged)) {
                tracing::warn!("Could not deliver artifact change: {}", e);
            }
        })?;

        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    /// Callback for the peer tracker: route a client death onto the loop
    pub fn death_sink(&self) -> impl Fn(PeerId) + Send + Sync + 'static {
        let events = self.events.clone();
        move |peer| {
            if let Err(e) = events.post(move |r| r.peer_died(peer)) {
                tracing::warn!("Could not deliver death of {}: {}", peer, e);
            }
        }
    }

    pub async fn bind(&self, caller: PeerId, request: BindRequest) -> Result<ServiceHandle> {
        if request.identity != self.identity {
            tracing::error!(
                "Bind for {} reached the endpoint of {}, aborting",
                request.identity,
                self.identity
            );
            self.exit.fire(ExitStatus::IdentityMismatch);
            anyhow::bail!("endpoint serves {}, not {}", self.identity, request.identity);
        }

        let _gate = self.gate.lock().await;
        if request.debug {
            self.registry
                .set_process_identity(&format!("{}:priv", self.identity.package()));
        }
        self.events.post_and_wait(move |r| r.bind(caller, request)).await?
    }

    pub async fn unbind(&self, caller: PeerId) -> Result<UnbindOutcome> {
        let _gate = self.gate.lock().await;
        self.events.post_and_wait(move |r| r.unbind(caller)).await
    }

    pub async fn stop(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        tracing::info!("{} stop requested", self.identity);
        self.events
            .post_and_wait(|r| r.terminate(StopReason::Requested))
            .await
    }

    /// Announce this endpoint again. Best effort: a failure is only logged.
    pub fn broadcast(&self) {
        if let Err(e) = self.announcer.announce(&self.endpoint) {
            tracing::warn!("Announcement of {} failed: {:#}", self.identity, e);
        }
    }

    pub async fn state(&self) -> Result<LifecycleState> {
        self.events.post_and_wait(|r| r.state).await
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.events.shutdown();
    }
}
