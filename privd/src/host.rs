//! Startup: defer to a running instance, or claim the identity and become
//! the resident endpoint.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use privd_client::RpcClient;
use shared::types::{Endpoint, ServiceIdentity};
use crate::lifecycle::{exit_channel, ExitStatus, ExitWaiter, LifecycleManager};
use crate::mdns::Announcer;
use crate::payload::PrivilegedService;
use crate::peers::PeerTracker;
use crate::registry::{Claim, ClaimGuard, ServiceRegistry};
use crate::server;

const BROADCAST_TIMEOUT: Duration = Duration::from_millis(500);
const CLAIM_RETRY: Duration = Duration::from_millis(50);

pub enum Takeover {
    /// Another instance serves this identity and was asked to re-announce
    Deferred,
    Claimed(Claimed),
}

/// This process won the identity; nothing has been started yet
pub struct Claimed {
    guard: ClaimGuard,
    endpoint: Endpoint,
}

impl Claimed {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Decide whether this process becomes the resident instance.
///
/// A registered endpoint that answers wins. Otherwise the registry claim
/// decides; a loser pokes the holder to re-announce and steps aside.
pub async fn takeover(
    registry: &dyn ServiceRegistry,
    identity: &ServiceIdentity,
    socket_dir: &Path,
    timeout: Duration,
) -> Result<Takeover> {
    let name = identity.registry_name();

    if let Some(existing) = registry.lookup(&name) {
        match request_broadcast(&existing).await {
            Ok(()) => {
                tracing::info!("{} already running as pid {}", identity, existing.pid);
                return Ok(Takeover::Deferred);
            }
            Err(e) => {
                tracing::warn!("Registered endpoint for {} is stale: {:#}", identity, e);
            }
        }
    }

    let socket = socket_dir.join(format!("{}.sock", name));
    let endpoint = Endpoint::new(identity.clone(), socket, std::process::id());
    let deadline = Instant::now() + timeout;

    loop {
        match registry.claim(&name, &endpoint)? {
            Claim::Acquired(guard) => {
                return Ok(Takeover::Claimed(Claimed { guard, endpoint }));
            }
            Claim::Held(Some(holder)) => match request_broadcast(&holder).await {
                Ok(()) => {
                    tracing::info!("{} is being started by pid {}", identity, holder.pid);
                    return Ok(Takeover::Deferred);
                }
                Err(e) => tracing::debug!("Claim holder not reachable yet: {:#}", e),
            },
            Claim::Held(None) => tracing::debug!("Claim holder has not published yet"),
        }

        if Instant::now() >= deadline {
            tracing::warn!("{} is claimed by a starter that never answered, stepping aside", identity);
            return Ok(Takeover::Deferred);
        }
        tokio::time::sleep(CLAIM_RETRY).await;
    }
}

async fn request_broadcast(endpoint: &Endpoint) -> Result<()> {
    let poke = async {
        let mut client = RpcClient::connect(endpoint).await?;
        client.broadcast().await
    };
    tokio::time::timeout(BROADCAST_TIMEOUT, poke)
        .await
        .context("Timed out waiting for broadcast")?
}

fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    // Safe to clear: only the claim holder gets here
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove stale socket {}", path.display()));
        }
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind to {}", path.display()))?;
    // Unprivileged clients must be able to connect
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("Failed to open up {}", path.display()))?;

    Ok(listener)
}

/// The running resident endpoint
pub struct Host {
    manager: Arc<LifecycleManager>,
    waiter: ExitWaiter,
    announcer: Arc<dyn Announcer>,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    _claim: ClaimGuard,
}

impl Host {
    pub async fn start(
        claimed: Claimed,
        artifact: &Path,
        registry: Arc<dyn ServiceRegistry>,
        announcer: Arc<dyn Announcer>,
        service: Box<dyn PrivilegedService>,
    ) -> Result<Self> {
        let Claimed { guard, endpoint } = claimed;
        let listener = bind_socket(&endpoint.socket)?;
        tracing::info!("Endpoint for {} listening on {}", endpoint.identity, endpoint.socket.display());

        let peers = Arc::new(PeerTracker::new());
        let (exit, waiter) = exit_channel();
        let manager = LifecycleManager::new(
            endpoint,
            service,
            registry,
            peers.clone(),
            announcer.clone(),
            exit,
        )?;
        manager.start().await?;
        peers.on_death(manager.death_sink());
        // The payload is created from here on; it must be destroyed on any failure
        if let Err(e) = manager.watch_artifact(artifact) {
            if let Err(stop_err) = manager.stop().await {
                tracing::error!("Failed to stop after startup error: {:#}", stop_err);
            }
            return Err(e);
        }
        let manager = Arc::new(manager);

        let cancel = CancellationToken::new();
        let server_manager = manager.clone();
        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = server::serve(listener, server_manager, peers, server_cancel).await {
                tracing::error!("Endpoint server error: {}", e);
            }
        });

        manager.broadcast();

        Ok(Self {
            manager,
            waiter,
            announcer,
            cancel,
            server,
            _claim: guard,
        })
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.manager.endpoint()
    }

    /// Wait for the exit decision, then stop accepting and withdraw the
    /// announcement. The caller exits the process with the returned status.
    pub async fn wait(mut self) -> ExitStatus {
        let status = self.waiter.wait().await;
        self.cancel.cancel();
        if let Err(e) = (&mut self.server).await {
            tracing::debug!("Endpoint server task ended abnormally: {}", e);
        }
        if let Err(e) = self.announcer.withdraw() {
            tracing::warn!("Failed to withdraw announcement: {:#}", e);
        }
        status
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use shared::protocol::UnbindOutcome;
    use shared::types::{BindFilter, BindRequest, ServiceHandle};
    use crate::payload::StaticService;
    use crate::registry::FsRegistry;

    #[derive(Default)]
    struct CountingAnnouncer {
        count: AtomicUsize,
    }

    impl Announcer for CountingAnnouncer {
        fn announce(&self, _endpoint: &Endpoint) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct UnreachableAnnouncer;

    impl Announcer for UnreachableAnnouncer {
        fn announce(&self, _endpoint: &Endpoint) -> Result<()> {
            anyhow::bail!("no multicast route")
        }
    }

    /// Counts lifecycle hooks; optionally crashes on bind
    #[derive(Clone, Default)]
    struct CountingService {
        creates: Arc<AtomicUsize>,
        destroys: Arc<AtomicUsize>,
        panic_on_bind: bool,
    }

    impl PrivilegedService for CountingService {
        fn on_create(&mut self) -> Result<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_bind(&mut self, _request: &BindRequest) -> Result<ServiceHandle> {
            if self.panic_on_bind {
                panic!("payload crashed in bind");
            }
            Ok(ServiceHandle("svc-handle".to_string()))
        }

        fn on_unbind(&mut self, _filter: &BindFilter) -> Result<bool> {
            Ok(true)
        }

        fn on_destroy(&mut self) -> Result<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Env {
        dir: tempfile::TempDir,
        registry: Arc<FsRegistry>,
        announcer: Arc<CountingAnnouncer>,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("base.apk"), b"app").unwrap();
            let registry = Arc::new(FsRegistry::new(dir.path().join("registry")));
            Self {
                dir,
                registry,
                announcer: Arc::new(CountingAnnouncer::default()),
            }
        }

        fn artifact(&self) -> std::path::PathBuf {
            self.dir.path().join("base.apk")
        }

        async fn takeover(&self) -> Takeover {
            takeover(
                self.registry.as_ref(),
                &identity(),
                &self.dir.path().join("sockets"),
                Duration::from_millis(300),
            )
            .await
            .unwrap()
        }

        async fn start(&self, keep_alive: bool) -> Host {
            self.start_with(
                &self.artifact(),
                self.announcer.clone(),
                Box::new(StaticService::new("svc-handle", keep_alive)),
            )
            .await
            .unwrap()
        }

        async fn start_with(
            &self,
            artifact: &Path,
            announcer: Arc<dyn Announcer>,
            service: Box<dyn PrivilegedService>,
        ) -> Result<Host> {
            let Takeover::Claimed(claimed) = self.takeover().await else {
                panic!("expected to claim the identity");
            };
            Host::start(claimed, artifact, self.registry.clone(), announcer, service).await
        }
    }

    fn identity() -> ServiceIdentity {
        ServiceIdentity::new("svc", "A").unwrap()
    }

    fn request(filter: &str) -> BindRequest {
        BindRequest::new(identity(), BindFilter::action(filter))
    }

    #[tokio::test]
    async fn test_second_starter_defers_and_pokes_broadcast() {
        let env = Env::new();
        let host = env.start(true).await;
        assert_eq!(env.announcer.count.load(Ordering::SeqCst), 1);

        assert!(matches!(env.takeover().await, Takeover::Deferred));
        assert_eq!(env.announcer.count.load(Ordering::SeqCst), 2);

        // Still not findable by name
        assert!(env.registry.lookup("svc:A").is_none());
        drop(host);
    }

    #[tokio::test]
    async fn test_concurrent_starters_claim_once() {
        let env = Arc::new(Env::new());

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let env = env.clone();
            tasks.push(tokio::spawn(async move { env.takeover().await }));
        }

        // Keep every outcome alive so the winner's claim is held throughout
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        let claimed = outcomes
            .iter()
            .filter(|t| matches!(t, Takeover::Claimed(_)))
            .count();
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn test_stale_registry_entry_is_ignored() {
        let env = Env::new();
        let stale = Endpoint::new(identity(), env.dir.path().join("gone.sock"), 999_999);
        env.registry.register("svc:A", &stale).unwrap();

        assert!(matches!(env.takeover().await, Takeover::Claimed(_)));
    }

    #[tokio::test]
    async fn test_bind_unbind_rebind_then_client_death() {
        let env = Env::new();
        let host = env.start(true).await;
        let endpoint = host.endpoint().clone();

        let mut first = RpcClient::connect(&endpoint).await.unwrap();
        let handle = first.bind(request("f1")).await.unwrap();
        assert_eq!(handle.0, "svc-handle");
        assert_eq!(first.unbind().await.unwrap(), UnbindOutcome::KeepRunning);
        drop(first);

        // Registered once the payload chose to stay up
        let registered = env.registry.lookup("svc:A").unwrap();
        assert_eq!(registered.socket, endpoint.socket);

        // A later starter finds it through the registry
        assert!(matches!(env.takeover().await, Takeover::Deferred));

        let mut second = RpcClient::connect(&registered).await.unwrap();
        second.bind(request("f1")).await.unwrap();
        drop(second);

        let status = tokio::time::timeout(Duration::from_secs(5), host.wait())
            .await
            .expect("client death should stop the endpoint");
        assert_eq!(status, ExitStatus::Success);
    }

    #[tokio::test]
    async fn test_stop_request_exits_success() {
        let env = Env::new();
        let host = env.start(true).await;

        let mut client = RpcClient::connect(host.endpoint()).await.unwrap();
        client.bind(request("f1")).await.unwrap();
        client.stop().await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), host.wait()).await.unwrap();
        assert_eq!(status, ExitStatus::Success);
    }

    #[tokio::test]
    async fn test_wrong_identity_exits_with_failure() {
        let env = Env::new();
        let host = env.start(true).await;

        let mut client = RpcClient::connect(host.endpoint()).await.unwrap();
        let wrong = BindRequest::new(ServiceIdentity::new("svc", "B").unwrap(), BindFilter::action("f1"));
        assert!(client.bind(wrong).await.is_err());

        let status = tokio::time::timeout(Duration::from_secs(5), host.wait()).await.unwrap();
        assert_eq!(status, ExitStatus::IdentityMismatch);
        assert_eq!(status.code(), 1);
    }

    #[tokio::test]
    async fn test_artifact_removal_exits() {
        let env = Env::new();
        let host = env.start(true).await;

        std::fs::remove_file(env.artifact()).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), host.wait()).await.unwrap();
        assert_eq!(status, ExitStatus::Success);
    }

    #[tokio::test]
    async fn test_crashing_bind_still_stoppable() {
        let env = Env::new();
        let service = CountingService {
            panic_on_bind: true,
            ..CountingService::default()
        };
        let host = env
            .start_with(&env.artifact(), env.announcer.clone(), Box::new(service.clone()))
            .await
            .unwrap();

        let mut client = RpcClient::connect(host.endpoint()).await.unwrap();
        assert!(client.bind(request("f1")).await.is_err());
        client.stop().await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), host.wait())
            .await
            .expect("stop should still reach the event loop");
        assert_eq!(status, ExitStatus::Success);
        assert_eq!(service.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_startup_failure_after_create_destroys() {
        let env = Env::new();
        let service = CountingService::default();
        let missing = env.dir.path().join("missing").join("base.apk");

        let started = env
            .start_with(&missing, env.announcer.clone(), Box::new(service.clone()))
            .await;

        assert!(started.is_err());
        assert_eq!(service.creates.load(Ordering::SeqCst), 1);
        assert_eq!(service.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_failure_still_answers_ok() {
        let env = Env::new();
        let host = env
            .start_with(
                &env.artifact(),
                Arc::new(UnreachableAnnouncer),
                Box::new(StaticService::new("svc-handle", true)),
            )
            .await
            .unwrap();

        let mut client = RpcClient::connect(host.endpoint()).await.unwrap();
        client.broadcast().await.unwrap();

        // A second starter recognises the live holder straight away
        let started = Instant::now();
        assert!(matches!(env.takeover().await, Takeover::Deferred));
        assert!(started.elapsed() < Duration::from_millis(300));
        drop(host);
    }
}
