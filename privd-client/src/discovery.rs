use std::time::Duration;
use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::PRIVD_SERVICE_TYPE;
use shared::types::{Endpoint, ServiceIdentity};

/// Listens for discovery announcements of resident endpoints.
///
/// Announcements are best effort: a missed one is recovered by asking the
/// registry again or by another announcement, never by this listener.
pub struct DiscoveryListener {
    daemon: ServiceDaemon,
    events: flume::Receiver<ServiceEvent>,
}

impl DiscoveryListener {
    /// Start browsing on a single interface (e.g. "lo")
    pub fn new(interface: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        daemon
            .enable_interface(interface)
            .with_context(|| format!("Failed to enable interface {}", interface))?;

        let events = daemon
            .browse(PRIVD_SERVICE_TYPE)
            .with_context(|| format!("Failed to browse {}", PRIVD_SERVICE_TYPE))?;

        Ok(Self { daemon, events })
    }

    /// Wait until an endpoint serving `identity` is announced
    pub async fn wait_for(&self, identity: &ServiceIdentity, timeout: Duration) -> Result<Endpoint> {
        let wait = async {
            loop {
                match self.events.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => match classify(&info, identity) {
                        Announcement::Wanted(endpoint) => return Ok(endpoint),
                        Announcement::Other(other) => {
                            tracing::trace!("Ignoring announcement for {}", other);
                        }
                        Announcement::Malformed => {
                            tracing::debug!("Skipping malformed announcement {}", info.get_fullname());
                        }
                    },
                    Ok(_) => {}
                    Err(e) => anyhow::bail!("mDNS browse channel closed: {}", e),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("No announcement for {} within {:?}", identity, timeout))?
    }

    pub fn shutdown(self) -> Result<()> {
        self.daemon.shutdown().context("Failed to shut down mDNS daemon")?;
        Ok(())
    }
}

/// How a resolved announcement relates to the identity being waited for
#[derive(Debug)]
pub enum Announcement {
    Wanted(Endpoint),
    Other(ServiceIdentity),
    Malformed,
}

/// Match a resolved announcement against `identity`
pub fn classify(info: &ServiceInfo, identity: &ServiceIdentity) -> Announcement {
    match Endpoint::from_txt(|key| info.get_property_val_str(key).map(str::to_string)) {
        Some(endpoint) if &endpoint.identity == identity => Announcement::Wanted(endpoint),
        Some(endpoint) => Announcement::Other(endpoint.identity),
        None => Announcement::Malformed,
    }
}
