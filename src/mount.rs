//! Share mounting.
//!
//! `MountClient` maps a share address to a local directory and makes sure it is mounted.
//! `CifsMountClient` uses `<mount_point_base>/<hash of the address>` as the mount point and
//! the system `mount -t cifs` helper.

use anyhow::{Context, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::DriverError;
use crate::shares::MountOptions;

pub trait MountClient: Send + Sync {
    /// Local directory the share is (or will be) mounted at.
    fn mount_point(&self, share: &str) -> PathBuf;

    /// Mount `share` with the per-share `options` (raw `-o ...` string). Already mounted is Ok.
    fn mount(&self, share: &str, options: Option<&str>) -> Result<()>;
}

/// Hex of the first 16 bytes of sha256(share).
pub fn share_hash(share: &str) -> String {
    let digest = Sha256::digest(share.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether `mount_point` shows up as a mount target in a mounts table (`/proc/mounts` format).
pub fn listed_in_mounts(table: &str, mount_point: &Path) -> bool {
    let want = mount_point.to_string_lossy();
    table.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .map(|target| unescape_mount_field(target) == want)
            .unwrap_or(false)
    })
}

// /proc/mounts escapes space, tab, newline and backslash as \ooo.
fn unescape_mount_field(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            if oct.iter().all(|c| (b'0'..=b'7').contains(c)) {
                let v = oct.iter().fold(0u32, |acc, c| acc * 8 + (c - b'0') as u32);
                if v <= 0xff {
                    out.push(v as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub struct CifsMountClient {
    base: PathBuf,
    default_options: MountOptions,
    mounts_table: PathBuf,
}

impl CifsMountClient {
    pub fn new<P: Into<PathBuf>>(base: P, default_options: &str) -> Self {
        Self {
            base: base.into(),
            default_options: MountOptions::parse(default_options),
            mounts_table: PathBuf::from("/proc/mounts"),
        }
    }

    pub fn with_mounts_table<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.mounts_table = p.into();
        self
    }

    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        let table = match fs::read_to_string(&self.mounts_table) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.mounts_table.display()))
            }
        };
        Ok(listed_in_mounts(&table, mount_point))
    }

    /// Effective option string for a share (defaults overlaid with the share's own).
    pub fn options_for(&self, options: Option<&str>) -> String {
        match options {
            Some(o) => {
                let own = MountOptions::parse(o).normalize_credentials();
                self.default_options.clone().merged(&own).to_option_string()
            }
            None => self.default_options.to_option_string(),
        }
    }
}

impl MountClient for CifsMountClient {
    fn mount_point(&self, share: &str) -> PathBuf {
        self.base.join(share_hash(share))
    }

    fn mount(&self, share: &str, options: Option<&str>) -> Result<()> {
        let mp = self.mount_point(share);
        fs::create_dir_all(&mp).with_context(|| format!("create mount point {}", mp.display()))?;

        if self.is_mounted(&mp)? {
            debug!("mount: {} already mounted at {}", share, mp.display());
            return Ok(());
        }

        let opts = self.options_for(options);
        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg("cifs").arg(share).arg(&mp);
        if !opts.is_empty() {
            cmd.arg("-o").arg(&opts);
        }
        let out = cmd
            .output()
            .with_context(|| format!("spawn mount for {}", share))?;
        if !out.status.success() {
            return Err(DriverError::BackendCommandFailed(format!(
                "mount -t cifs {} {} failed: {}",
                share,
                mp.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            ))
            .into());
        }
        info!("mount: {} mounted at {}", share, mp.display());
        Ok(())
    }
}
