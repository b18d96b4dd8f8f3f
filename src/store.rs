//! Durable task configuration storage.
//!
//! The supervisor only sees the [`TaskStore`] trait. [`JsonTaskStore`] keeps
//! the task list as a pretty-printed JSON array on disk; [`MemoryTaskStore`]
//! keeps it in memory for tests and throwaway sessions.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use thiserror::Error;

use crate::task::TaskConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read task store '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task store '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write task store '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize tasks: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("task store '{path}' is in use by another supervisor")]
    Locked { path: PathBuf },
}

/// Where task configurations live between runs.
pub trait TaskStore: Send + Sync {
    fn load(&self) -> Result<Vec<TaskConfig>, StoreError>;

    /// Replace the stored set with `tasks`.
    fn save(&self, tasks: &[TaskConfig]) -> Result<(), StoreError>;
}

/// JSON file store guarded by an exclusive lock on `<path>.lock`.
pub struct JsonTaskStore {
    path: PathBuf,
    // Held for the store's lifetime; the lock is released on drop.
    _lock: File,
}

impl JsonTaskStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Write {
                path: lock_path.clone(),
                source,
            })?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked { path });
        }

        tracing::debug!(path = %path.display(), "opened task store");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskStore for JsonTaskStore {
    fn load(&self) -> Result<Vec<TaskConfig>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, tasks: &[TaskConfig]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(tasks).map_err(StoreError::Serialize)?;
        let tmp = self.path.with_extension("json.tmp");
        let write_error = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let mut file = File::create(&tmp).map_err(write_error)?;
        file.write_all(json.as_bytes()).map_err(write_error)?;
        file.sync_all().map_err(write_error)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(write_error)?;
        Ok(())
    }
}

/// In-memory store; nothing survives the process.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<TaskConfig>>,
}

impl MemoryTaskStore {
    pub fn new(tasks: Vec<TaskConfig>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }
}

impl TaskStore for MemoryTaskStore {
    fn load(&self) -> Result<Vec<TaskConfig>, StoreError> {
        Ok(self.tasks.lock().clone())
    }

    fn save(&self, tasks: &[TaskConfig]) -> Result<(), StoreError> {
        *self.tasks.lock() = tasks.to_vec();
        Ok(())
    }
}
