//! Bounded per-task output history.
//!
//! The buffer is a byte ring: once `capacity` is reached the oldest bytes
//! are evicted. Every operation takes the same lock, so a snapshot taken
//! while an append is in flight sees either all of that append or none.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::task::TaskId;

pub struct ScrollbackBuffer {
    inner: Mutex<Ring>,
}

struct Ring {
    data: VecDeque<u8>,
    capacity: usize,
    mirror: Option<LogMirror>,
}

impl ScrollbackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                data: VecDeque::new(),
                capacity: capacity.max(1),
                mirror: None,
            }),
        }
    }

    /// Buffer backed by an on-disk log, seeded with the log's tail.
    pub fn with_mirror(capacity: usize, mirror: LogMirror) -> Self {
        let buffer = Self::new(capacity);
        {
            let mut ring = buffer.inner.lock();
            let capacity = ring.capacity;
            match mirror.read_tail(capacity) {
                Ok(tail) => ring.push(&tail),
                Err(err) => tracing::warn!(
                    path = %mirror.path().display(),
                    error = %err,
                    "failed to read scrollback log"
                ),
            }
            ring.mirror = Some(mirror);
        }
        buffer
    }

    pub fn append(&self, bytes: &[u8]) {
        self.append_then(bytes, || ());
    }

    /// Append and run `then` before any other party can observe the buffer.
    pub fn append_then<R>(&self, bytes: &[u8], then: impl FnOnce() -> R) -> R {
        let mut ring = self.inner.lock();
        ring.push(bytes);
        if let Some(mirror) = ring.mirror.as_mut() {
            mirror.append(bytes);
        }
        then()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.snapshot_then(|| ()).0
    }

    /// Snapshot and run `then` with no append in between.
    pub fn snapshot_then<R>(&self, then: impl FnOnce() -> R) -> (Vec<u8>, R) {
        let ring = self.inner.lock();
        let snapshot = ring.data.iter().copied().collect();
        (snapshot, then())
    }

    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.data.clear();
        if let Some(mirror) = ring.mirror.as_mut() {
            mirror.truncate();
        }
    }

    /// Clear and remove the on-disk log, if any.
    pub fn discard(&self) {
        let mut ring = self.inner.lock();
        ring.data.clear();
        if let Some(mirror) = ring.mirror.take() {
            mirror.remove();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

impl Ring {
    fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            self.data.clear();
            self.data
                .extend(bytes[bytes.len() - self.capacity..].iter().copied());
            return;
        }
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(bytes.iter().copied());
    }
}

/// Append-only log file named `<dir>/<task id>.log`.
pub struct LogMirror {
    path: PathBuf,
    file: Option<File>,
}

impl LogMirror {
    pub fn open(dir: &Path, id: &TaskId) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.log", id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_tail(&self, limit: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let size = file.metadata()?.len();
        let take = size.min(limit as u64);
        file.seek(SeekFrom::Start(size - take))?;
        let mut buffer = Vec::with_capacity(take as usize);
        file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, bytes: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(bytes) {
            tracing::warn!(path = %self.path.display(), error = %err, "scrollback log write failed; disabling log");
            self.file = None;
        }
    }

    fn truncate(&mut self) {
        if let Some(file) = self.file.as_ref() {
            if let Err(err) = file.set_len(0) {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to truncate scrollback log");
            }
        }
    }

    fn remove(self) {
        drop(self.file);
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove scrollback log");
            }
        }
    }
}
