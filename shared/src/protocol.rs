use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use crate::types::{BindRequest, Endpoint, ServiceHandle, ServiceIdentity};

/// mDNS service type used for discovery announcements
pub const PRIVD_SERVICE_TYPE: &str = "_privd._tcp.local.";

/// TXT record keys carried by a discovery announcement
pub const TXT_IDENTITY: &str = "identity";
pub const TXT_SOCKET: &str = "socket";
pub const TXT_PID: &str = "pid";
pub const TXT_STARTED: &str = "started";

/// Environment toggle for verbose diagnostic logging
pub const VERBOSE_ENV: &str = "PRIVD_VERBOSE";

/// A call against a resident endpoint. One JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Bind(BindRequest),
    Unbind,
    Stop,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Bound { handle: ServiceHandle },
    Unbound { outcome: UnbindOutcome },
    Ok,
    Error { message: String },
}

/// What the endpoint did with an unbind request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnbindOutcome {
    /// Payload wants to stay up; the endpoint registered itself by name
    KeepRunning,
    /// Payload is done; the endpoint is shutting down
    Exiting,
    /// Caller is not the bound client
    Ignored,
}

impl Endpoint {
    /// TXT records for a discovery announcement of this endpoint
    pub fn to_txt(&self) -> HashMap<String, String> {
        HashMap::from([
            (TXT_IDENTITY.to_string(), self.identity.to_string()),
            (TXT_SOCKET.to_string(), self.socket.display().to_string()),
            (TXT_PID.to_string(), self.pid.to_string()),
            (TXT_STARTED.to_string(), self.started_at.to_rfc3339()),
        ])
    }

    /// Rebuild an endpoint from announcement TXT records.
    /// Returns None if any record is missing or malformed.
    pub fn from_txt(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let identity: ServiceIdentity = get(TXT_IDENTITY)?.parse().ok()?;
        let socket = get(TXT_SOCKET)?.into();
        let pid = get(TXT_PID)?.parse().ok()?;
        let started_at = chrono::DateTime::parse_from_rfc3339(&get(TXT_STARTED)?)
            .ok()?
            .with_timezone(&chrono::Utc);

        Some(Self {
            identity,
            socket,
            pid,
            started_at,
        })
    }
}
