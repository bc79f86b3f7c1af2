use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::VERBOSE_ENV;
use shared::types::ServiceIdentity;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub package: String,
    pub component: String,
    /// Installed application artifact; the endpoint exits when it goes away
    pub artifact: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_registry_dir")]
    pub registry_dir: PathBuf,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// How long a losing starter keeps trying to reach the claim holder
    #[serde(default = "default_takeover_timeout")]
    pub takeover_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_address")]
    pub address: String,
}

/// Settings for the payload bundled with the binary
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadConfig {
    #[serde(default)]
    pub handle: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
}

fn default_registry_dir() -> PathBuf {
    PathBuf::from("/run/privd/registry")
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/privd")
}

fn default_takeover_timeout() -> u64 {
    2000
}

fn default_interface() -> String {
    "lo".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_keep_alive() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            registry_dir: default_registry_dir(),
            socket_dir: default_socket_dir(),
            takeover_timeout_ms: default_takeover_timeout(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            address: default_address(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            handle: String::new(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl ServiceConfig {
    pub fn identity(&self) -> Result<ServiceIdentity> {
        ServiceIdentity::new(&self.package, &self.component).context("Invalid service identity")
    }
}

impl RuntimeConfig {
    pub fn takeover_timeout(&self) -> Duration {
        Duration::from_millis(self.takeover_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

/// Whether verbose diagnostic logging was requested through the environment.
/// Absent, empty, `0` and `false` all mean disabled.
pub fn verbose_logging() -> bool {
    parse_toggle(std::env::var(VERBOSE_ENV).ok().as_deref())
}

fn parse_toggle(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [service]
            package = "com.example"
            component = "com.example.Root"
            artifact = "/data/app/com.example/base.apk"
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.registry_dir, PathBuf::from("/run/privd/registry"));
        assert_eq!(config.runtime.takeover_timeout(), Duration::from_secs(2));
        assert_eq!(config.discovery.interface, "lo");
        assert!(config.payload.keep_alive);
        assert_eq!(config.service.identity().unwrap().registry_name(), "com.example:com.example.Root");
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let config: Config = toml::from_str(
            r#"
            [service]
            package = "com.example"
            component = "a/b"
            artifact = "/tmp/x"
            "#,
        )
        .unwrap();

        assert!(config.service.identity().is_err());
    }

    #[test]
    fn test_verbose_toggle() {
        assert!(!parse_toggle(None));
        assert!(!parse_toggle(Some("")));
        assert!(!parse_toggle(Some("0")));
        assert!(!parse_toggle(Some("FALSE")));
        assert!(parse_toggle(Some("1")));
        assert!(parse_toggle(Some("yes")));
    }
}
