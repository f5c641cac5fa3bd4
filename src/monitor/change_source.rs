//! Filesystem change source built on the `notify` crate.
//!
//! The parent directory is watched rather than the file itself so that
//! editors which replace the file (write to temp, then rename) keep producing
//! events. Every event for the credentials file is stamped with the file's
//! modification time as reported by the filesystem.

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::WatchError;

/// A raw "the record may have changed" notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChange {
    /// Storage-reported modification time at the moment the event was seen
    pub modified: DateTime<Utc>,
}

#[derive(Debug)]
pub enum WatchEvent {
    Changed(RawChange),
    Failed(WatchError),
}

/// Keeps the underlying watcher alive. Dropping it stops notifications.
pub struct FileChangeSource {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeSource")
            .field("path", &self.path)
            .finish()
    }
}

impl FileChangeSource {
    /// Start watching `path` and forward events to `events`.
    ///
    /// Fails if the containing directory cannot be watched.
    pub fn watch(
        path: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self, WatchError> {
        let path = path.into();
        let file_name = path.file_name().map(OsString::from).ok_or_else(|| {
            WatchError::Establish {
                path: path.clone(),
                source: notify::Error::generic("credentials path has no file name"),
            }
        })?;
        let directory = watch_directory(&path);

        let callback_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    let _ = events.send(WatchEvent::Failed(WatchError::Stream {
                        path: callback_path.clone(),
                        message: e.to_string(),
                    }));
                    return;
                }
            };

            if !is_relevant(&event, &file_name) {
                return;
            }

            match modified_time(&callback_path) {
                Some(modified) => {
                    trace!("Raw change for {:?} at {}", callback_path, modified);
                    let _ = events.send(WatchEvent::Changed(RawChange { modified }));
                }
                None => debug!("{:?} changed but is not readable, ignoring", callback_path),
            }
        })
        .map_err(|source| WatchError::Establish {
            path: path.clone(),
            source,
        })?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Establish {
                path: path.clone(),
                source,
            })?;

        debug!("Watching {:?} for changes to {:?}", directory, path);
        Ok(Self {
            path,
            _watcher: watcher,
        })
    }
}

fn watch_directory(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_watch_directory_for_bare_file_name() {
        assert_eq!(watch_directory(Path::new("credentials.json")), PathBuf::from("."));
        assert_eq!(
            watch_directory(Path::new("/etc/svc/credentials.json")),
            PathBuf::from("/etc/svc")
        );
    }

    #[test]
    fn test_relevance_filters_kind_and_name() {
        let name = OsString::from("credentials.json");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/tmp/x/credentials.json"));
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/tmp/x/credentials.json"));
        let other_file = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/tmp/x/other.json"));
        let remove = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/tmp/x/credentials.json"));

        assert!(is_relevant(&modify, &name));
        assert!(is_relevant(&create, &name));
        assert!(!is_relevant(&other_file, &name));
        assert!(!is_relevant(&remove, &name));
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("does-not-exist").join("credentials.json");
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = FileChangeSource::watch(path, tx).unwrap_err();
        assert!(matches!(err, WatchError::Establish { .. }));
    }

    #[tokio::test]
    async fn test_write_produces_raw_change() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("credentials.json");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _source = FileChangeSource::watch(&path, tx).unwrap();
        std::fs::write(&path, r#"{"Username":"alice","Password":"pw"}"#).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("no change event within timeout")
            .expect("channel closed");
        assert!(matches!(event, WatchEvent::Changed(_)));
    }
}
