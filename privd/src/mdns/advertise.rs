use std::sync::{Mutex, PoisonError};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::PRIVD_SERVICE_TYPE;
use shared::types::Endpoint;

/// Best-effort, system-wide announcement of a resident endpoint.
///
/// No acknowledgement and no delivery guarantee; announcing the same
/// endpoint again is harmless.
pub trait Announcer: Send + Sync {
    fn announce(&self, endpoint: &Endpoint) -> Result<()>;

    /// Retract the announcement on the way out
    fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}

/// Announces endpoints as mDNS service instances carrying the endpoint in
/// their TXT records.
pub struct MdnsAnnouncer {
    daemon: ServiceDaemon,
    address: String,
    registered: Mutex<Option<String>>,
}

impl MdnsAnnouncer {
    pub fn new(interface: &str, address: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        daemon
            .enable_interface(interface)
            .with_context(|| format!("Failed to enable interface {}", interface))?;

        Ok(Self {
            daemon,
            address: address.to_string(),
            registered: Mutex::new(None),
        })
    }
}

impl Announcer for MdnsAnnouncer {
    fn announce(&self, endpoint: &Endpoint) -> Result<()> {
        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        let service_info = announcement(endpoint, &format!("{}.local.", hostname), &self.address)?;

        let fullname = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .context("Failed to register mDNS service")?;

        tracing::info!("Announced {} as {}", endpoint.identity, fullname);
        *self.registered.lock().unwrap_or_else(PoisonError::into_inner) = Some(fullname);
        Ok(())
    }

    fn withdraw(&self) -> Result<()> {
        let fullname = self.registered.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(fullname) = fullname {
            self.daemon
                .unregister(&fullname)
                .context("Failed to unregister mDNS service")?;
            tracing::info!("Unregistered {}", fullname);
        }

        self.daemon.shutdown().context("Failed to shut down mDNS daemon")?;
        Ok(())
    }
}

/// Service instance for `endpoint`, carrying it in the TXT records
fn announcement(endpoint: &Endpoint, host_name: &str, address: &str) -> Result<ServiceInfo> {
    let instance_name = format!("privd-{}", endpoint.pid);

    // The endpoint is a local socket; the SRV port carries no meaning
    ServiceInfo::new(
        PRIVD_SERVICE_TYPE,
        &instance_name,
        host_name,
        address,
        0,
        endpoint.to_txt(),
    )
    .context("Failed to create ServiceInfo")
}
