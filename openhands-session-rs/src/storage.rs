use crate::errors::StorageError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Key/value file storage used to persist events and controller state.
///
/// Paths are `/`-separated strings relative to the store root.
pub trait FileStore: Send + Sync {
    fn write(&self, path: &str, contents: &str) -> Result<(), StorageError>;

    fn read(&self, path: &str) -> Result<String, StorageError>;

    /// Paths of the entries stored directly below `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    fn delete(&self, path: &str) -> Result<(), StorageError>;
}

pub fn session_dir(sid: &str) -> String {
    format!("sessions/{}", sid)
}

pub fn events_dir(sid: &str) -> String {
    format!("sessions/{}/events", sid)
}

pub fn event_path(sid: &str, id: u64) -> String {
    format!("sessions/{}/events/{}.json", sid, id)
}

pub fn agent_state_path(sid: &str) -> String {
    format!("sessions/{}/agent_state.json", sid)
}

/// Process-local store, mostly for tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryFileStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for InMemoryFileStore {
    fn write(&self, path: &str, contents: &str) -> Result<(), StorageError> {
        self.files.lock().insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String, StorageError> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let files = self.files.lock();
        let mut entries: Vec<String> = files
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                let child = rest.split('/').next()?;
                Some(format!("{}{}", prefix, child))
            })
            .collect();
        entries.dedup();
        Ok(entries)
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files
            .lock()
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        Ok(())
    }
}

/// Store rooted at a directory on the host filesystem.
pub struct LocalFileStore {
    pub root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    if source.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io {
            path: path.to_string(),
            source,
        }
    }
}

impl FileStore for LocalFileStore {
    fn write(&self, path: &str, contents: &str) -> Result<(), StorageError> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
        }
        fs::write(&full, contents).map_err(|e| io_error(path, e))
    }

    fn read(&self, path: &str) -> Result<String, StorageError> {
        fs::read_to_string(self.full_path(path)).map_err(|e| io_error(path, e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(self.full_path(prefix)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(prefix, e)),
        };
        let prefix = prefix.trim_end_matches('/');
        let mut paths: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .map(|name| format!("{}/{}", prefix, name))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.full_path(path);
        let result = if full.is_dir() {
            fs::remove_dir_all(&full)
        } else {
            fs::remove_file(&full)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }
}
