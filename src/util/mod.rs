//! Small filesystem helpers shared by the driver modules.
//!
//! Contains:
//! - set_rw_permissions_for_all(): make an image file readable/writable by everyone
//!   (hypervisor processes run under a different uid than the driver).
//! - apparent_size_excluding(): recursive apparent size of a tree, skipping names with a marker.
//! - split_ext(): file-name stem/extension split used for snapshot file names.
//! - unique_tmp_path(): sibling temp path for flatten/convert steps.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// chmod 0666 on unix; no-op elsewhere.
pub fn set_rw_permissions_for_all(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o666);
        fs::set_permissions(path, perms)
            .with_context(|| format!("chmod 0666 {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Sum of apparent file sizes under `root`, skipping entries whose name contains `exclude`.
/// Excluded directories are not descended into. Symlinks are not followed.
pub fn apparent_size_excluding(root: &Path, exclude: &str) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let rd = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("read_dir {}", dir.display())),
        };
        for entry in rd {
            let entry = entry.with_context(|| format!("read_dir entry in {}", dir.display()))?;
            let name = entry.file_name();
            if name.to_string_lossy().contains(exclude) {
                continue;
            }
            let md = entry
                .path()
                .symlink_metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            if md.is_dir() {
                stack.push(entry.path());
            } else if md.is_file() {
                total = total.saturating_add(md.len());
            }
        }
    }
    Ok(total)
}

/// ("volume-1", ".vhdx") for "volume-1.vhdx"; ("volume-1", "") without extension.
pub fn split_ext(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(i) if i > 0 => filename.split_at(i),
        _ => (filename, ""),
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(1);

/// `<dir>/.<stem>.<tag>.<pid>-<nanos>-<seq>` next to `near`.
pub fn unique_tmp_path(near: &Path, tag: &str) -> PathBuf {
    let dir = near.parent().unwrap_or_else(|| Path::new("."));
    let stem = near
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        ".{}.{}.{}-{}-{}",
        stem,
        tag,
        std::process::id(),
        t,
        seq
    ))
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
