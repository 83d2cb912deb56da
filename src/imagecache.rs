//! Base-image cache.
//!
//! Layout of a cache entry: `<cache_dir>/<image_id>[-<subformat>].<format>`.
//! The cache dir is `image_cache_dir`, or the destination volume's directory when caching
//! at destination. Entries are never evicted.
//!
//! `get_image` runs under a per-image-id guard. With caching off the image is fetched to a
//! hidden temp file next to the destination, verified, size-checked and renamed over it.
//! With caching on:
//! 1) if the cache entry is missing: convert the first cached file of the same image id, or
//!    fetch from the catalog (then verify/convert the format);
//! 2) materialize the destination: plain copy, or a differencing child of the cached entry
//!    in copy-on-write mode;
//! 3) grow to the requested size. Shrinking is refused before the destination is touched.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::ImageCatalog;
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::image_tool::ImageTool;
use crate::lock::KeyedLocks;
use crate::metrics::{record_cache_conversion, record_cache_fetch, record_cache_hit, record_image_resize};
use crate::model::VolumeFormat;
use crate::shares::GIB;
use crate::util::{remove_file_if_exists, split_ext, unique_tmp_path};

pub struct ImageCache {
    tool: Arc<dyn ImageTool>,
    locks: KeyedLocks,
    cache_dir: PathBuf,
    cache_fetched_images: bool,
    cache_at_destination: bool,
}

impl ImageCache {
    pub fn new(tool: Arc<dyn ImageTool>, cache_dir: PathBuf) -> Self {
        Self {
            tool,
            locks: KeyedLocks::new(),
            cache_dir,
            cache_fetched_images: false,
            cache_at_destination: false,
        }
    }

    pub fn from_config(tool: Arc<dyn ImageTool>, cfg: &DriverConfig) -> Self {
        Self::new(tool, cfg.image_cache_dir.clone())
            .with_cache_fetched_images(cfg.cache_fetched_images)
            .with_cache_at_destination(cfg.cache_at_destination)
    }

    pub fn with_cache_fetched_images(mut self, on: bool) -> Self {
        self.cache_fetched_images = on;
        self
    }

    /// Cache next to the destination and create destinations as differencing children.
    pub fn with_cache_at_destination(mut self, on: bool) -> Self {
        self.cache_at_destination = on;
        self
    }

    pub fn with_locks(mut self, locks: KeyedLocks) -> Self {
        self.locks = locks;
        self
    }

    fn cache_dir_for(&self, destination: &Path) -> PathBuf {
        if self.cache_at_destination {
            destination
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            self.cache_dir.clone()
        }
    }

    /// `<cache_dir>/<image_id>[-<subformat>].<format>`
    pub fn cached_image_path(
        cache_dir: &Path,
        image_id: &str,
        format: VolumeFormat,
        subformat: Option<&str>,
    ) -> PathBuf {
        let sub = subformat.map(|s| format!("-{}", s)).unwrap_or_default();
        cache_dir.join(format!("{}{}.{}", image_id, sub, format.as_str()))
    }

    /// Files in `cache_dir` named `<image_id>.<ext>` or `<image_id>-<subformat>.<ext>`,
    /// sorted by name.
    pub fn cached_images(image_id: &str, cache_dir: &Path) -> Result<Vec<PathBuf>> {
        let rd = match fs::read_dir(cache_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read_dir {}", cache_dir.display())),
        };
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let own = name
                .strip_prefix(image_id)
                .map(|rest| rest.starts_with('.') || rest.starts_with('-'))
                .unwrap_or(false);
            if own && entry.path().is_file() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Materialize image `image_id` at `destination` with `size_gib` virtual size.
    pub fn get_image(
        &self,
        catalog: &dyn ImageCatalog,
        image_id: &str,
        destination: &Path,
        format: VolumeFormat,
        size_gib: u64,
        subformat: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.lock(image_id);

        if !self.cache_fetched_images {
            return self.fetch_to_destination(catalog, image_id, destination, format, size_gib, subformat);
        }

        let cache_dir = self.cache_dir_for(destination);
        let fetch_path = Self::cached_image_path(&cache_dir, image_id, format, subformat);

        if fetch_path.exists() && fetch_path != destination {
            record_cache_hit();
            debug!("imagecache: hit {} at {}", image_id, fetch_path.display());
        } else {
            let cached = Self::cached_images(image_id, &cache_dir)?;
            match cached.first() {
                Some(src) => {
                    info!(
                        "imagecache: converting cached {} -> {} ({})",
                        src.display(),
                        fetch_path.display(),
                        format
                    );
                    self.tool
                        .convert(src, &fetch_path, format.tool_name(), subformat)
                        .with_context(|| format!("convert cached image {}", src.display()))?;
                    record_cache_conversion();
                }
                None => {
                    self.fetch(catalog, image_id, &fetch_path, format, subformat)?;
                    record_cache_fetch();
                }
            }
        }

        self.handle_requested_image(&fetch_path, destination, format, size_gib)
    }

    /// Uncached path: the destination is only replaced once the fetched image passed the
    /// format and size checks.
    fn fetch_to_destination(
        &self,
        catalog: &dyn ImageCatalog,
        image_id: &str,
        destination: &Path,
        format: VolumeFormat,
        size_gib: u64,
        subformat: Option<&str>,
    ) -> Result<()> {
        if let Some(dir) = destination.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let tmp = unique_tmp_path(destination, "fetch");
        if let Err(e) = catalog.fetch(image_id, &tmp) {
            let _ = remove_file_if_exists(&tmp);
            return Err(e).with_context(|| format!("fetch image {}", image_id));
        }
        record_cache_fetch();

        let checked = self
            .verify_format(&tmp, format, subformat)
            .and_then(|()| self.is_resize_needed(&tmp, size_gib));
        let grow = match checked {
            Ok(grow) => grow,
            Err(e) => {
                let _ = remove_file_if_exists(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, destination) {
            let _ = remove_file_if_exists(&tmp);
            return Err(e)
                .with_context(|| format!("rename {} -> {}", tmp.display(), destination.display()));
        }
        info!("imagecache: fetched {} -> {}", image_id, destination.display());

        if grow {
            self.resize(destination, size_gib)?;
        }
        Ok(())
    }

    fn fetch(
        &self,
        catalog: &dyn ImageCatalog,
        image_id: &str,
        fetch_path: &Path,
        format: VolumeFormat,
        subformat: Option<&str>,
    ) -> Result<()> {
        if let Some(dir) = fetch_path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        // Land under a hidden temp name so an interrupted download never looks like an entry.
        let tmp = unique_tmp_path(fetch_path, "fetch");
        if let Err(e) = catalog.fetch(image_id, &tmp) {
            let _ = remove_file_if_exists(&tmp);
            return Err(e).with_context(|| format!("fetch image {}", image_id));
        }
        fs::rename(&tmp, fetch_path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), fetch_path.display()))?;
        info!("imagecache: fetched {} -> {}", image_id, fetch_path.display());

        self.verify_format(fetch_path, format, subformat)
    }

    /// Convert a fetched image in place when it came in a different format than requested.
    fn verify_format(&self, path: &Path, format: VolumeFormat, subformat: Option<&str>) -> Result<()> {
        let actual = self.tool.info(path)?;
        if actual.volume_format() == Some(format) {
            return Ok(());
        }
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (stem, _) = split_ext(&name);
        let tmp = path.with_file_name(format!("{}-tmp.{}", stem, format.as_str()));
        info!(
            "imagecache: {} is {}, converting to {}",
            path.display(),
            actual.format,
            format
        );
        self.tool
            .convert(path, &tmp, format.tool_name(), subformat)
            .with_context(|| format!("convert fetched image {}", path.display()))?;
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// true: grow to `size_gib`; false: already that size. Smaller request is an error.
    fn is_resize_needed(&self, path: &Path, size_gib: u64) -> Result<bool> {
        let current = self.tool.info(path)?.virtual_size;
        let requested = size_gib.saturating_mul(GIB);
        if requested < current {
            return Err(DriverError::SizeMismatch(format!(
                "cannot resize image {} to a smaller size: image size {}, requested {}",
                path.display(),
                current,
                requested
            ))
            .into());
        }
        Ok(requested > current)
    }

    fn resize(&self, path: &Path, size_gib: u64) -> Result<()> {
        self.tool
            .resize(path, size_gib.saturating_mul(GIB))
            .with_context(|| format!("resize {} to {} GiB", path.display(), size_gib))?;
        record_image_resize();
        Ok(())
    }

    fn handle_requested_image(
        &self,
        fetch_path: &Path,
        destination: &Path,
        format: VolumeFormat,
        size_gib: u64,
    ) -> Result<()> {
        // Size check on the source first: a shrink request must not leave a destination behind.
        let grow = self.is_resize_needed(fetch_path, size_gib)?;

        if destination == fetch_path {
            if grow {
                self.resize(destination, size_gib)?;
            }
            return Ok(());
        }

        if self.cache_at_destination {
            if grow && !format.can_resize_differencing() {
                self.resize(fetch_path, size_gib)?;
            }
            self.tool
                .create(destination, format.tool_name(), None, Some(fetch_path))
                .with_context(|| {
                    format!(
                        "create differencing image {} on {}",
                        destination.display(),
                        fetch_path.display()
                    )
                })?;
            if grow && format.can_resize_differencing() {
                self.resize(destination, size_gib)?;
            }
        } else {
            fs::copy(fetch_path, destination).with_context(|| {
                format!("copy {} -> {}", fetch_path.display(), destination.display())
            })?;
            if grow {
                self.resize(destination, size_gib)?;
            }
        }
        Ok(())
    }
}
