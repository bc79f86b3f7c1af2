use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Key naming a logical privileged service, e.g.
/// `com.example.app/com.example.app.RootService`.
///
/// Used both as the registry key and as the discovery address.
/// Neither part may be empty or contain `/`, `:` or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "IdentityParts")]
pub struct ServiceIdentity {
    package: String,
    component: String,
}

#[derive(Deserialize)]
struct IdentityParts {
    package: String,
    component: String,
}

impl ServiceIdentity {
    pub fn new(package: impl Into<String>, component: impl Into<String>) -> anyhow::Result<Self> {
        let package = package.into();
        let component = component.into();
        validate_part("package", &package)?;
        validate_part("component", &component)?;
        Ok(Self { package, component })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Stable name under which the resident endpoint is registered
    pub fn registry_name(&self) -> String {
        format!("{}:{}", self.package, self.component)
    }
}

fn validate_part(what: &str, value: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        anyhow::bail!("service {} must not be empty", what);
    }
    if let Some(c) = value.chars().find(|c| matches!(c, '/' | ':') || c.is_whitespace() || c.is_control()) {
        anyhow::bail!("service {} {:?} contains invalid character {:?}", what, value, c);
    }
    Ok(())
}

impl TryFrom<IdentityParts> for ServiceIdentity {
    type Error = anyhow::Error;

    fn try_from(parts: IdentityParts) -> Result<Self, Self::Error> {
        Self::new(parts.package, parts.component)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.component)
    }
}

impl FromStr for ServiceIdentity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (package, component) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("expected <package>/<component>, got {:?}", s))?;
        Self::new(package, component)
    }
}

/// Handle to a resident endpoint: where to reach it and who it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub identity: ServiceIdentity,

    /// Unix socket the endpoint accepts calls on
    pub socket: PathBuf,

    /// Process id of the resident instance
    pub pid: u32,

    pub started_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(identity: ServiceIdentity, socket: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            identity,
            socket: socket.into(),
            pid,
            started_at: Utc::now(),
        }
    }
}

/// Filterable part of a bind request. Remembered from the first bind
/// and handed back to the payload on unbind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
}

impl BindFilter {
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindRequest {
    /// Identity the caller expects to be talking to
    pub identity: ServiceIdentity,

    #[serde(default)]
    pub filter: BindFilter,

    /// Free-form parameters for the payload. Not part of the filter.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,

    /// Rename the resident process so a debugger can find it
    #[serde(default)]
    pub debug: bool,
}

impl BindRequest {
    pub fn new(identity: ServiceIdentity, filter: BindFilter) -> Self {
        Self {
            identity,
            filter,
            extras: BTreeMap::new(),
            debug: false,
        }
    }
}

/// Opaque handle the payload hands out to a bound client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceHandle(pub String);

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
