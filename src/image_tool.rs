//! Image tool collaborator: inspect/create/convert/resize/commit/rebase of disk images.
//!
//! `ImageTool` is the seam the chain code talks to. `QemuImg` drives the `qemu-img` binary;
//! tests plug an in-memory implementation.
//!
//! Contracts the chain algorithms rely on:
//! - `commit(path)` merges `path` into its backing file AND removes `path`.
//! - `rebase(path, name, fmt)` only rewrites the backing pointer (no data copy).
//! - `info(path).backing_file` may be a full path; callers reduce it to a basename.

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::Deserialize;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::DriverError;
use crate::model::VolumeFormat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Format name as reported by the tool ("qcow2", "raw", "vpc", "vhdx", ...).
    pub format: String,
    pub virtual_size: u64,
    pub backing_file: Option<String>,
}

impl ImageInfo {
    pub fn volume_format(&self) -> Option<VolumeFormat> {
        VolumeFormat::parse(&self.format)
    }

    /// Backing reference reduced to a file name (chains only deal with relative names).
    pub fn backing_filename(&self) -> Option<String> {
        self.backing_file
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(basename)
    }
}

pub trait ImageTool: Send + Sync {
    fn info(&self, path: &Path) -> Result<ImageInfo>;

    /// Create an image. `backing` makes it a differencing child; `size_bytes` may be
    /// omitted then (inherits the backing virtual size).
    fn create(
        &self,
        path: &Path,
        format: &str,
        size_bytes: Option<u64>,
        backing: Option<&Path>,
    ) -> Result<()>;

    fn convert(&self, src: &Path, dst: &Path, format: &str, subformat: Option<&str>) -> Result<()>;

    fn resize(&self, path: &Path, size_bytes: u64) -> Result<()>;

    /// Merge `path` into its backing file and remove `path`.
    fn commit(&self, path: &Path) -> Result<()>;

    /// Point `path` at `backing_name` (relative) of format `backing_format`.
    fn rebase(&self, path: &Path, backing_name: &str, backing_format: &str) -> Result<()>;

    /// Tool version as [major, minor, ...] when it can report one.
    fn version(&self) -> Result<Option<Vec<u32>>> {
        Ok(None)
    }
}

pub fn basename(s: &str) -> String {
    Path::new(s)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(s)
        .to_string()
}

// ---------------- qemu-img ----------------

#[derive(Deserialize)]
struct QemuInfoJson {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "backing-filename", default)]
    backing_filename: Option<String>,
}

/// `qemu-img` process adapter.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImg {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<std::ffi::OsString> =
            args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!("qemu-img: {} {:?}", self.binary.display(), args);

        let out = Command::new(&self.binary)
            .args(&args)
            .output()
            .with_context(|| format!("spawn {}", self.binary.display()))?;

        if !out.status.success() {
            return Err(DriverError::BackendCommandFailed(format!(
                "{} {:?} exited with {:?}: {}",
                self.binary.display(),
                args,
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

fn parse_version(out: &str) -> Option<Vec<u32>> {
    let rest = out.trim_start().strip_prefix("qemu-img version ")?;
    let ver: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let parts: Option<Vec<u32>> = ver
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect();
    parts.filter(|p| !p.is_empty())
}

impl ImageTool for QemuImg {
    fn info(&self, path: &Path) -> Result<ImageInfo> {
        let out = self.run([
            OsStr::new("info"),
            OsStr::new("--output=json"),
            path.as_os_str(),
        ])?;
        let parsed: QemuInfoJson = serde_json::from_str(&out)
            .with_context(|| format!("parse qemu-img info for {}", path.display()))?;
        Ok(ImageInfo {
            format: parsed.format,
            virtual_size: parsed.virtual_size,
            backing_file: parsed.backing_filename.filter(|s| !s.is_empty()),
        })
    }

    fn create(
        &self,
        path: &Path,
        format: &str,
        size_bytes: Option<u64>,
        backing: Option<&Path>,
    ) -> Result<()> {
        let mut args: Vec<std::ffi::OsString> = vec!["create".into(), "-f".into(), format.into()];
        if let Some(b) = backing {
            let mut opt = std::ffi::OsString::from("backing_file=");
            opt.push(b.as_os_str());
            args.push("-o".into());
            args.push(opt);
        }
        args.push(path.as_os_str().to_os_string());
        if let Some(sz) = size_bytes {
            args.push(sz.to_string().into());
        }
        self.run(args).map(|_| ())
    }

    fn convert(&self, src: &Path, dst: &Path, format: &str, subformat: Option<&str>) -> Result<()> {
        let mut args: Vec<std::ffi::OsString> = vec!["convert".into(), "-O".into(), format.into()];
        if let Some(sub) = subformat {
            args.push("-o".into());
            args.push(format!("subformat={}", sub).into());
        }
        args.push(src.as_os_str().to_os_string());
        args.push(dst.as_os_str().to_os_string());
        self.run(args).map(|_| ())
    }

    fn resize(&self, path: &Path, size_bytes: u64) -> Result<()> {
        self.run([
            OsStr::new("resize"),
            path.as_os_str(),
            OsStr::new(&size_bytes.to_string()),
        ])
        .map(|_| ())
    }

    fn commit(&self, path: &Path) -> Result<()> {
        self.run([OsStr::new("commit"), path.as_os_str()])?;
        fs::remove_file(path).with_context(|| format!("remove committed {}", path.display()))?;
        Ok(())
    }

    fn rebase(&self, path: &Path, backing_name: &str, backing_format: &str) -> Result<()> {
        self.run([
            OsStr::new("rebase"),
            OsStr::new("-u"),
            OsStr::new("-b"),
            OsStr::new(backing_name),
            OsStr::new("-F"),
            OsStr::new(backing_format),
            path.as_os_str(),
        ])
        .map(|_| ())
    }

    fn version(&self) -> Result<Option<Vec<u32>>> {
        let out = self.run(["--version"])?;
        parse_version(&out)
            .map(Some)
            .ok_or_else(|| anyhow!("unrecognized qemu-img version output"))
    }
}
