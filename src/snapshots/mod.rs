//! Snapshots module split into submodules:
//! - create.rs: add a differencing child on top of the active image.
//! - delete.rs: merge a snapshot out of the chain (active vs interior case).
//! - reconcile.rs: re-derive the `active` pointer from on-disk backing references.
//!
//! All three work on a `VolumeChain`: the canonical volume file, its directory, its format
//! and the image tool. They take no locks; `ShareDriver` holds the volume guard around them.

mod create;
mod delete;
mod reconcile;

pub use create::create_snapshot;
pub use delete::{delete_snapshot, DeleteOutcome};
pub use reconcile::{reconcile_active, ReconcileReport};

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::chain::{chain_for, BackingNode};
use crate::error::DriverError;
use crate::image_tool::ImageTool;
use crate::info::{self, ChainInfo};
use crate::model::VolumeFormat;
use crate::util::split_ext;

/// One volume's chain as seen from disk.
pub struct VolumeChain<'a> {
    tool: &'a dyn ImageTool,
    volume_path: PathBuf,
    volume_dir: PathBuf,
    volume_filename: String,
    format: VolumeFormat,
}

impl<'a> VolumeChain<'a> {
    /// `volume_path` is the canonical (root) file of the volume.
    pub fn new(tool: &'a dyn ImageTool, volume_path: &Path, format: VolumeFormat) -> Result<Self> {
        let volume_filename = volume_path
            .file_name()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                DriverError::InvalidVolumeState(format!(
                    "volume path {} has no file name",
                    volume_path.display()
                ))
            })?;
        let volume_dir = volume_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            tool,
            volume_path: volume_path.to_path_buf(),
            volume_dir,
            volume_filename,
            format,
        })
    }

    pub fn tool(&self) -> &dyn ImageTool {
        self.tool
    }

    pub fn volume_path(&self) -> &Path {
        &self.volume_path
    }

    pub fn volume_dir(&self) -> &Path {
        &self.volume_dir
    }

    pub fn volume_filename(&self) -> &str {
        &self.volume_filename
    }

    pub fn format(&self) -> VolumeFormat {
        self.format
    }

    pub fn info_path(&self) -> PathBuf {
        info::info_path(&self.volume_path)
    }

    pub fn read_info(&self, empty_if_missing: bool) -> Result<ChainInfo> {
        info::read_info(&self.info_path(), empty_if_missing)
    }

    pub fn write_info(&self, info: &ChainInfo) -> Result<()> {
        info::write_info(&self.info_path(), info)
    }

    /// Path of a chain member given its (relative) file name.
    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.volume_dir.join(filename)
    }

    /// File name the guest writes to: `active` from the record, else the volume file.
    pub fn active_filename(&self) -> Result<String> {
        let info = self.read_info(true)?;
        Ok(info
            .active()
            .map(str::to_string)
            .unwrap_or_else(|| self.volume_filename.clone()))
    }

    pub fn active_path(&self) -> Result<PathBuf> {
        Ok(self.path_of(&self.active_filename()?))
    }

    /// `<volume stem>-snapshot<id><ext>`.
    pub fn snapshot_filename(&self, snapshot_id: &str) -> String {
        let (stem, ext) = split_ext(&self.volume_filename);
        format!("{}-snapshot{}{}", stem, snapshot_id, ext)
    }

    /// Chain from the active image down to the root, bounded by the record size.
    pub fn walk(&self, info: &ChainInfo) -> Result<Vec<BackingNode>> {
        let active = info.active().unwrap_or(&self.volume_filename);
        chain_for(
            self.tool,
            &self.volume_dir,
            &self.path_of(active),
            info.snapshot_count() + 1,
        )
    }
}
