//! Locking for chain-mutating operations.
//!
//! Two layers:
//! - `KeyedLocks`: in-process registry key -> "held" flag with a Condvar. One instance is
//!   injected into the driver (per-volume keys) and one into the image cache (per-image keys).
//!   A guard releases its key on Drop.
//! - `VolumeFileLock`: fs2 advisory lock on `<volume_path>.lock`, so a CLI process and a
//!   long-running service do not interleave commit/rebase on the same chain.
//!
//! Order: keyed guard first, then the file lock.

use anyhow::{Context, Result};
use fs2::FileExt;
use log::debug;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct Held {
    keys: HashSet<String>,
}

struct Inner {
    held: Mutex<Held>,
    cv: Condvar,
}

/// Registry of named mutual-exclusion scopes.
#[derive(Clone)]
pub struct KeyedLocks {
    inner: Arc<Inner>,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                held: Mutex::new(Held::default()),
                cv: Condvar::new(),
            }),
        }
    }

    fn held(&self) -> MutexGuard<'_, Held> {
        // A panicking holder only leaves a stale key behind if its guard was leaked;
        // the set itself stays consistent, so poisoning is ignored.
        self.inner.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Block until `key` is free, then hold it until the guard drops.
    pub fn lock(&self, key: &str) -> KeyedGuard {
        let mut held = self.held();
        while held.keys.contains(key) {
            held = self
                .inner
                .cv
                .wait(held)
                .unwrap_or_else(|p| p.into_inner());
        }
        held.keys.insert(key.to_string());
        debug!("lock: acquired key={}", key);
        KeyedGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
        }
    }

    /// Non-blocking variant: None if the key is currently held.
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let mut held = self.held();
        if held.keys.contains(key) {
            return None;
        }
        held.keys.insert(key.to_string());
        Some(KeyedGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held().keys.contains(key)
    }
}

pub struct KeyedGuard {
    inner: Arc<Inner>,
    key: String,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut held = self.inner.held.lock().unwrap_or_else(|p| p.into_inner());
        held.keys.remove(&self.key);
        drop(held);
        self.inner.cv.notify_all();
        debug!("lock: released key={}", self.key);
    }
}

/// Exclusive fs2 lock on a sidecar file. Released on Drop.
pub struct VolumeFileLock {
    file: std::fs::File,
    path: PathBuf,
}

impl VolumeFileLock {
    /// Acquire an exclusive lock on `path` (created if missing). Blocks until acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock_exclusive {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VolumeFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
