//! Supervisor for a single privileged service process.
//!
//! One resident instance per service identity serves bind/unbind/stop calls
//! from unprivileged clients over a local socket, announces itself for
//! discovery, and exits when its client dies, when asked to, or when the
//! application it belongs to is removed.

pub mod config;
pub mod event_loop;
pub mod host;
pub mod lifecycle;
pub mod mdns;
pub mod payload;
pub mod peers;
pub mod registry;
pub mod server;
pub mod watcher;

pub use host::{takeover, Host, Takeover};
pub use lifecycle::{ExitStatus, LifecycleManager, LifecycleState};
pub use payload::PrivilegedService;
