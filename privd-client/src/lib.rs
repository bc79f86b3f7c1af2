//! Client side of the privd endpoint: direct calls over the endpoint socket
//! and waiting for discovery announcements.

pub mod discovery;
pub mod rpc;

pub use discovery::DiscoveryListener;
pub use rpc::RpcClient;
