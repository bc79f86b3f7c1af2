use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use anyhow::{Context, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};

type Trigger = Box<dyn FnOnce() + Send>;

/// Watches the installed application artifact and fires once when it is
/// deleted, moved away, replaced, or its directory disappears.
///
/// Delivery stops as soon as this value is dropped, so it must be owned by
/// something that lives as long as the service.
pub struct ArtifactWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl ArtifactWatcher {
    /// `on_change` runs on the notification thread; it should only hand the
    /// event off (e.g. post to the event loop).
    pub fn start(artifact: &Path, on_change: impl FnOnce() + Send + 'static) -> Result<Self> {
        let dir = artifact
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let target = artifact
            .file_name()
            .map(|n| n.to_os_string())
            .with_context(|| format!("Artifact path has no file name: {}", artifact.display()))?;

        let trigger: Arc<Mutex<Option<Trigger>>> = Arc::new(Mutex::new(Some(Box::new(on_change))));
        let watched_dir = dir.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_terminal(&event, &watched_dir, &target) {
                    let fire = trigger.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Some(fire) = fire {
                        tracing::info!("Host artifact changed: {:?} {:?}", event.kind, event.paths);
                        fire();
                    }
                }
            }
            Err(e) => tracing::warn!("Artifact watch error: {}", e),
        })
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        tracing::info!("Start monitoring: {}", dir.display());

        Ok(Self {
            _watcher: watcher,
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_terminal(event: &Event, dir: &Path, target: &OsString) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    if !relevant {
        return false;
    }

    event.paths.iter().any(|path| {
        // Removal of the watched directory itself
        let dir_gone = matches!(event.kind, EventKind::Remove(_)) && path == dir;
        dir_gone || path.file_name() == Some(target.as_os_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use std::sync::mpsc;
    use std::time::Duration;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_terminal_event_classification() {
        let dir = Path::new("/data/app/pkg");
        let target = OsString::from("base.apk");

        assert!(is_terminal(&event(EventKind::Remove(RemoveKind::File), "/data/app/pkg/base.apk"), dir, &target));
        assert!(is_terminal(&event(EventKind::Create(CreateKind::File), "/data/app/pkg/base.apk"), dir, &target));
        assert!(is_terminal(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), "/data/app/pkg/base.apk"),
            dir,
            &target
        ));
        assert!(is_terminal(&event(EventKind::Remove(RemoveKind::Folder), "/data/app/pkg"), dir, &target));

        assert!(!is_terminal(&event(EventKind::Remove(RemoveKind::File), "/data/app/pkg/other.odex"), dir, &target));
        assert!(!is_terminal(
            &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), "/data/app/pkg/base.apk"),
            dir,
            &target
        ));
    }

    #[test]
    fn test_fires_once_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("base.apk");
        let unrelated = dir.path().join("lib.so");
        std::fs::write(&artifact, b"v1").unwrap();
        std::fs::write(&unrelated, b"x").unwrap();

        let (tx, rx) = mpsc::channel();
        let watcher = ArtifactWatcher::start(&artifact, move || tx.send(()).unwrap()).unwrap();
        assert_eq!(watcher.dir(), dir.path());

        std::fs::remove_file(&unrelated).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        std::fs::remove_file(&artifact).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).expect("watcher should fire");

        std::fs::write(&artifact, b"v2").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("gone").join("base.apk");
        assert!(ArtifactWatcher::start(&artifact, || {}).is_err());
    }
}
