// src/info.rs: per-volume backing-chain info record
//
// File: <volume_path>.info (JSON, sorted keys)
// {
//  "active": "volume-1-snapshot2",
//  "1": "volume-1-snapshot1",
//  "2": "volume-1-snapshot2"
// }
//
// Policy:
// - keys are snapshot ids plus the literal "active"; values are file names relative to
//   the volume's mount directory (never full paths).
// - no file == no snapshots; the active image is then the volume file itself.
// - atomic write: tmp + fsync + rename, then best-effort fsync of the parent directory.
// - a record without "active" is never written.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
#[cfg(unix)]
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::DriverError;

pub const ACTIVE_KEY: &str = "active";
pub const INFO_SUFFIX: &str = ".info";

/// Snapshot-id -> filename mapping plus the `active` pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainInfo {
    entries: BTreeMap<String, String>,
}

impl ChainInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active(&self) -> Option<&str> {
        self.entries.get(ACTIVE_KEY).map(|s| s.as_str())
    }

    pub fn set_active(&mut self, filename: &str) {
        self.entries.insert(ACTIVE_KEY.to_string(), filename.to_string());
    }

    pub fn get(&self, snapshot_id: &str) -> Option<&str> {
        if snapshot_id == ACTIVE_KEY {
            return None;
        }
        self.entries.get(snapshot_id).map(|s| s.as_str())
    }

    pub fn contains(&self, snapshot_id: &str) -> bool {
        self.get(snapshot_id).is_some()
    }

    pub fn insert(&mut self, snapshot_id: &str, filename: &str) {
        self.entries
            .insert(snapshot_id.to_string(), filename.to_string());
    }

    pub fn remove(&mut self, snapshot_id: &str) -> Option<String> {
        if snapshot_id == ACTIVE_KEY {
            return None;
        }
        self.entries.remove(snapshot_id)
    }

    /// Snapshot entries (id, filename), `active` excluded, sorted by id.
    pub fn snapshots(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter(|(k, _)| k.as_str() != ACTIVE_KEY)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots().count()
    }

    /// The snapshot id (never `active`) whose file is `filename`.
    pub fn id_for_file(&self, filename: &str) -> Option<&str> {
        self.snapshots()
            .find(|(_, f)| *f == filename)
            .map(|(id, _)| id)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }
}

#[inline]
pub fn info_path(volume_path: &Path) -> PathBuf {
    let mut s = volume_path.as_os_str().to_os_string();
    s.push(INFO_SUFFIX);
    PathBuf::from(s)
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Read the record at `path`.
///
/// Missing file: empty record when `empty_if_missing`, otherwise `DriverError::NotFound`.
pub fn read_info(path: &Path, empty_if_missing: bool) -> Result<ChainInfo> {
    if !path.exists() {
        if empty_if_missing {
            return Ok(ChainInfo::new());
        }
        return Err(DriverError::NotFound(format!("info file {}", path.display())).into());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let entries: BTreeMap<String, String> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse info file {}", path.display()))?;
    Ok(ChainInfo { entries })
}

/// Atomically replace the record at `path`. Fails before touching disk if `active` is missing.
pub fn write_info(path: &Path, info: &ChainInfo) -> Result<()> {
    if info.active().is_none() {
        return Err(DriverError::InvalidState(format!(
            "'{}' must be present when writing {}",
            ACTIVE_KEY,
            path.display()
        ))
        .into());
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let _ = fs::remove_file(&tmp); // best-effort

    let data = serde_json::to_vec_pretty(&info.entries).context("serialize info record")?;
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("open info tmp {}", tmp.display()))?;
        f.write_all(&data)?;
        f.sync_all()?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    let _ = fsync_dir(path);
    Ok(())
}

/// Remove the record (volume deletion). Missing file is fine.
pub fn delete_info(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
