use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use anyhow::Result;

/// One connected caller. Its connection doubles as its liveness handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Registration of death notifications for peers
pub trait PeerLinks: Send + Sync {
    /// Ask to be told when `peer` goes away. Fails if it already has.
    fn link(&self, peer: PeerId) -> Result<()>;

    /// Withdraw a link. Returns false if `peer` was not linked.
    fn unlink(&self, peer: PeerId) -> bool;
}

type DeathSink = Box<dyn Fn(PeerId) + Send + Sync>;

#[derive(Default)]
struct Peers {
    open: HashSet<PeerId>,
    linked: HashSet<PeerId>,
}

/// Tracks open connections and which of them have a death link.
///
/// When a linked peer disconnects the link is consumed and the death sink
/// runs exactly once for it.
pub struct PeerTracker {
    next: AtomicU64,
    peers: Mutex<Peers>,
    sink: OnceLock<DeathSink>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            peers: Mutex::new(Peers::default()),
            sink: OnceLock::new(),
        }
    }

    /// Install the death sink. Only the first call has any effect.
    pub fn on_death(&self, sink: impl Fn(PeerId) + Send + Sync + 'static) {
        if self.sink.set(Box::new(sink)).is_err() {
            tracing::warn!("Peer death sink already installed");
        }
    }

    pub fn connected(&self) -> PeerId {
        let peer = PeerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.lock().open.insert(peer);
        peer
    }

    pub fn disconnected(&self, peer: PeerId) {
        let was_linked = {
            let mut peers = self.lock();
            peers.open.remove(&peer);
            peers.linked.remove(&peer)
        };

        if was_linked {
            tracing::info!("Bound client {} died", peer);
            match self.sink.get() {
                Some(sink) => sink(peer),
                None => tracing::error!("No death sink installed; {} lost", peer),
            }
        }
    }

    pub fn is_linked(&self, peer: PeerId) -> bool {
        self.lock().linked.contains(&peer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerLinks for PeerTracker {
    fn link(&self, peer: PeerId) -> Result<()> {
        let mut peers = self.lock();
        if !peers.open.contains(&peer) {
            anyhow::bail!("{} is no longer connected", peer);
        }
        peers.linked.insert(peer);
        Ok(())
    }

    fn unlink(&self, peer: PeerId) -> bool {
        self.lock().linked.remove(&peer)
    }
}
