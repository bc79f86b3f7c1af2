//! Access to the host's named-service registry and process identity.
//!
//! The registry maps a service's registry name to the endpoint of its
//! resident instance. Absence is the normal case at startup, so `lookup`
//! returns `None` rather than an error, and degrades to `None` on any
//! failure to read the registry.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use shared::types::Endpoint;

pub trait ServiceRegistry: Send + Sync {
    /// Endpoint registered under `name`, if any
    fn lookup(&self, name: &str) -> Option<Endpoint>;

    /// Publish `endpoint` under `name`, replacing any previous entry
    fn register(&self, name: &str, endpoint: &Endpoint) -> Result<()>;

    /// Try to become the single resident instance for `name`.
    ///
    /// The claim lasts as long as the returned guard is alive and is
    /// released by the OS if the holder dies.
    fn claim(&self, name: &str, endpoint: &Endpoint) -> Result<Claim>;

    /// Rename the current process, best effort
    fn set_process_identity(&self, label: &str);
}

pub enum Claim {
    Acquired(ClaimGuard),
    /// Someone else holds the claim. Their endpoint, if already published.
    Held(Option<Endpoint>),
}

/// Holds the exclusive startup lock for one registry name
pub struct ClaimGuard {
    _lock: File,
    name: String,
}

impl ClaimGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry backed by a directory of JSON endpoint records
pub struct FsRegistry {
    dir: PathBuf,
}

impl FsRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    fn claim_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.claim", name))
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create registry directory: {}", self.dir.display()))
    }
}

impl ServiceRegistry for FsRegistry {
    fn lookup(&self, name: &str) -> Option<Endpoint> {
        let path = self.record_path(name);
        match read_endpoint(&path) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!("Registry lookup for {} failed, treating as absent: {:#}", name, e);
                None
            }
        }
    }

    fn register(&self, name: &str, endpoint: &Endpoint) -> Result<()> {
        self.ensure_dir()?;
        write_endpoint(&self.record_path(name), endpoint)?;
        tracing::info!("Registered {} at {}", name, endpoint.socket.display());
        Ok(())
    }

    fn claim(&self, name: &str, endpoint: &Endpoint) -> Result<Claim> {
        self.ensure_dir()?;
        let lock_path = self.lock_path(name);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        let acquired = sys::try_lock_exclusive(&lock)
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;

        if !acquired {
            // The holder may not have published yet; a read failure is the same as unpublished
            let holder = read_endpoint(&self.claim_path(name)).ok().flatten();
            return Ok(Claim::Held(holder));
        }

        write_endpoint(&self.claim_path(name), endpoint)?;
        tracing::debug!("Claimed {}", name);

        Ok(Claim::Acquired(ClaimGuard {
            _lock: lock,
            name: name.to_string(),
        }))
    }

    fn set_process_identity(&self, label: &str) {
        match sys::set_process_name(label) {
            Ok(()) => tracing::debug!("Process identity set to {}", label),
            Err(e) => tracing::warn!("Failed to set process identity to {}: {}", label, e),
        }
    }
}

fn read_endpoint(path: &Path) -> Result<Option<Endpoint>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    let endpoint = serde_json::from_str(&contents)
        .with_context(|| format!("Malformed endpoint record: {}", path.display()))?;
    Ok(Some(endpoint))
}

/// Write via a temp file and rename so readers never see a partial record
fn write_endpoint(path: &Path, endpoint: &Endpoint) -> Result<()> {
    let json = serde_json::to_string(endpoint).context("Failed to serialize endpoint")?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// Non-blocking exclusive flock. `Ok(false)` if another open file holds it.
    pub(super) fn try_lock_exclusive(file: &File) -> io::Result<bool> {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    /// comm holds at most 15 bytes plus NUL; cut on a char boundary
    pub(super) fn comm_name(label: &str) -> String {
        let mut name = String::new();
        for c in label.chars().filter(|c| *c != '\0') {
            if name.len() + c.len_utf8() > 15 {
                break;
            }
            name.push(c);
        }
        name
    }

    /// Renames the thread group leader, which is what `ps` and `top` show
    #[cfg(target_os = "linux")]
    pub(super) fn set_process_name(label: &str) -> io::Result<()> {
        std::fs::write("/proc/self/comm", comm_name(label))
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn set_process_name(_label: &str) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "process renaming not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::ServiceIdentity;

    fn endpoint(dir: &Path) -> Endpoint {
        let identity = ServiceIdentity::new("svc", "A").unwrap();
        Endpoint::new(identity, dir.join("svc:A.sock"), std::process::id())
    }

    #[test]
    fn test_comm_name_fits_kernel_limit() {
        assert_eq!(sys::comm_name("svc:priv"), "svc:priv");
        assert_eq!(sys::comm_name("com.example.app:priv"), "com.example.app");
        // 14 ASCII bytes, then a two-byte char that would straddle the limit
        assert_eq!(sys::comm_name("abcdefghijklmné"), "abcdefghijklmn");
        assert_eq!(sys::comm_name("a\0b"), "ab");
    }

    #[test]
    fn test_lookup_absent_until_register() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path().join("registry"));

        assert!(registry.lookup("svc:A").is_none());

        let ep = endpoint(dir.path());
        registry.register("svc:A", &ep).unwrap();

        let found = registry.lookup("svc:A").unwrap();
        assert_eq!(found.socket, ep.socket);
        assert!(registry.lookup("svc:B").is_none());
    }

    #[test]
    fn test_malformed_record_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("svc:A.json"), "not json").unwrap();
        let registry = FsRegistry::new(dir.path());

        assert!(registry.lookup("svc:A").is_none());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        let ep = endpoint(dir.path());

        let guard = match registry.claim("svc:A", &ep).unwrap() {
            Claim::Acquired(guard) => guard,
            Claim::Held(_) => panic!("first claim should succeed"),
        };
        assert_eq!(guard.name(), "svc:A");

        match registry.claim("svc:A", &ep).unwrap() {
            Claim::Held(Some(holder)) => assert_eq!(holder.socket, ep.socket),
            _ => panic!("second claim should see the holder"),
        }

        // Claims do not register
        assert!(registry.lookup("svc:A").is_none());

        drop(guard);
        assert!(matches!(registry.claim("svc:A", &ep).unwrap(), Claim::Acquired(_)));
    }
}
