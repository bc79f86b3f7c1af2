use anyhow::Result;
use shared::types::{BindFilter, BindRequest, ServiceHandle};

/// The privileged service hosted by the endpoint.
///
/// Every hook runs on the event loop thread, never concurrently with
/// another hook.
pub trait PrivilegedService: Send + 'static {
    /// Called once, before the first bind
    fn on_create(&mut self) -> Result<()> {
        Ok(())
    }

    /// First bind of this instance
    fn on_bind(&mut self, request: &BindRequest) -> Result<ServiceHandle>;

    /// Any later bind, after a filter has been remembered
    fn on_rebind(&mut self, request: &BindRequest) -> Result<ServiceHandle> {
        self.on_bind(request)
    }

    /// The bound client let go. `filter` is the one remembered from the
    /// first bind. Return `true` to keep running for future clients.
    fn on_unbind(&mut self, filter: &BindFilter) -> Result<bool>;

    /// Called exactly once before the process exits
    fn on_destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Payload bundled with the binary: hands every client the same handle.
pub struct StaticService {
    handle: ServiceHandle,
    keep_alive: bool,
}

impl StaticService {
    pub fn new(handle: impl Into<String>, keep_alive: bool) -> Self {
        Self {
            handle: ServiceHandle(handle.into()),
            keep_alive,
        }
    }
}

impl PrivilegedService for StaticService {
    fn on_bind(&mut self, request: &BindRequest) -> Result<ServiceHandle> {
        tracing::debug!("Handing out {} for {:?}", self.handle, request.filter);
        Ok(self.handle.clone())
    }

    fn on_unbind(&mut self, _filter: &BindFilter) -> Result<bool> {
        Ok(self.keep_alive)
    }
}
