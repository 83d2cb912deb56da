//! Image catalog collaborator.
//!
//! `DirCatalog` keeps images as plain files in a directory:
//!   <root>/<image_id>        image bytes
//!   <root>/<image_id>.json   ImageMeta (optional for fetch, written by upload)

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::DriverError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disk_format: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ImageMeta {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

pub trait ImageCatalog: Send + Sync {
    /// Download image bytes to `dest` (overwriting).
    fn fetch(&self, image_id: &str, dest: &Path) -> Result<()>;

    fn show(&self, image_id: &str) -> Result<ImageMeta>;

    /// Store `path` as image `meta.id` with the given disk format.
    fn upload(&self, meta: &ImageMeta, path: &Path, format: &str) -> Result<()>;
}

pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn image_path(&self, image_id: &str) -> PathBuf {
        self.root.join(image_id)
    }

    fn meta_path(&self, image_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", image_id))
    }

    fn require(&self, image_id: &str) -> Result<PathBuf> {
        if image_id.is_empty() || image_id.contains('/') {
            return Err(DriverError::NotFound(format!("image '{}'", image_id)).into());
        }
        let p = self.image_path(image_id);
        if !p.is_file() {
            return Err(DriverError::NotFound(format!("image {} in {}", image_id, self.root.display())).into());
        }
        Ok(p)
    }
}

impl ImageCatalog for DirCatalog {
    fn fetch(&self, image_id: &str, dest: &Path) -> Result<()> {
        let src = self.require(image_id)?;
        fs::copy(&src, dest)
            .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
        info!("catalog: fetched {} -> {}", image_id, dest.display());
        Ok(())
    }

    fn show(&self, image_id: &str) -> Result<ImageMeta> {
        let src = self.require(image_id)?;
        let mp = self.meta_path(image_id);
        let mut meta = if mp.exists() {
            let bytes = fs::read(&mp).with_context(|| format!("read {}", mp.display()))?;
            serde_json::from_slice::<ImageMeta>(&bytes)
                .with_context(|| format!("parse {}", mp.display()))?
        } else {
            ImageMeta::new(image_id)
        };
        if meta.size.is_none() {
            meta.size = Some(fs::metadata(&src)?.len());
        }
        Ok(meta)
    }

    fn upload(&self, meta: &ImageMeta, path: &Path, format: &str) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create catalog dir {}", self.root.display()))?;
        let dst = self.image_path(&meta.id);
        fs::copy(path, &dst).with_context(|| format!("copy {} -> {}", path.display(), dst.display()))?;

        let mut stored = meta.clone();
        stored.disk_format = Some(format.to_string());
        stored.size = Some(fs::metadata(&dst)?.len());

        let mp = self.meta_path(&meta.id);
        let mut tmp_name = mp.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .with_context(|| format!("open {}", tmp.display()))?;
            f.write_all(&serde_json::to_vec_pretty(&stored)?)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &mp).with_context(|| format!("rename {} -> {}", tmp.display(), mp.display()))?;
        info!("catalog: uploaded {} as {} ({})", path.display(), meta.id, format);
        Ok(())
    }
}
