//! Centralized configuration and builder for the share driver.
//!
//! Goals:
//! - One place for tunables instead of env lookups scattered over the driver.
//! - `DriverConfig::from_env()` reads the `SV_*` variables on top of defaults.
//! - `DriverBuilder` returns a `DriverConfig`, which `ShareDriver` consumes.
//!
//! Admission defaults mirror a conservative deployment:
//! - used_ratio = 0.95 (stop placing volumes once 95% of the share is really used)
//! - oversub_ratio = 1.0 (no thin-provisioning beyond the share size)
//!
//! `validate()` is called by `ShareDriver::do_setup` and rejects ratios out of range.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

use crate::error::DriverError;
use crate::model::VolumeFormat;

/// Top-level configuration of the driver.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// File listing the shares, one `//host/export [-o opts]` per line.
    /// Env: SV_SHARES_CONFIG (default /etc/sharevol/shares)
    pub shares_config: PathBuf,

    /// Format used when a volume does not carry one.
    /// Env: SV_DEFAULT_VOLUME_FORMAT = raw|qcow2|vhd|vhdx (default raw)
    pub default_volume_format: VolumeFormat,

    /// Create raw volumes as sparse files (fast) instead of zero-filled ones.
    /// Env: SV_SPARSED_VOLUMES (default true)
    pub sparsed_volumes: bool,

    /// Max real usage fraction of a share before it stops accepting volumes.
    /// Env: SV_USED_RATIO (default 0.95), must be in (0, 1].
    pub used_ratio: f64,

    /// Allowed allocated/total ratio (thin provisioning).
    /// Env: SV_OVERSUB_RATIO (default 1.0), must be > 0.
    pub oversub_ratio: f64,

    /// Base directory for share mount points.
    /// Env: SV_MOUNT_POINT_BASE (default /var/lib/sharevol/mnt)
    pub mount_point_base: PathBuf,

    /// Options passed to the cifs mount helper.
    /// Env: SV_MOUNT_OPTIONS (default noperm,file_mode=0775,dir_mode=0775)
    pub mount_options: String,

    /// Shared directory for cached base images.
    /// Env: SV_IMAGE_CACHE_DIR (default /var/lib/sharevol/image_cache)
    pub image_cache_dir: PathBuf,

    /// Keep fetched images in the cache instead of fetching straight to the volume.
    /// Env: SV_CACHE_FETCHED_IMAGES (default false)
    pub cache_fetched_images: bool,

    /// Cache next to the destination volume and create volumes as differencing
    /// children of the cached image (copy-on-write mode).
    /// Env: SV_CACHE_AT_DESTINATION (default false)
    pub cache_at_destination: bool,

    /// Image tool binary.
    /// Env: SV_QEMU_IMG (default qemu-img)
    pub qemu_img_path: PathBuf,

    /// Block size hint for image copies, bytes.
    /// Env: SV_BLOCK_SIZE (default 1 MiB)
    pub block_size: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            shares_config: PathBuf::from("/etc/sharevol/shares"),
            default_volume_format: VolumeFormat::Raw,
            sparsed_volumes: true,

            used_ratio: 0.95,
            oversub_ratio: 1.0,

            mount_point_base: PathBuf::from("/var/lib/sharevol/mnt"),
            mount_options: "noperm,file_mode=0775,dir_mode=0775".to_string(),

            image_cache_dir: PathBuf::from("/var/lib/sharevol/image_cache"),
            cache_fetched_images: false,
            cache_at_destination: false,

            qemu_img_path: PathBuf::from("qemu-img"),
            block_size: 1 << 20,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl DriverConfig {
    /// Defaults overridden by `SV_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(s) = env_string("SV_SHARES_CONFIG") {
            cfg.shares_config = PathBuf::from(s);
        }
        if let Some(s) = env_string("SV_DEFAULT_VOLUME_FORMAT") {
            if let Some(f) = VolumeFormat::parse(&s) {
                cfg.default_volume_format = f;
            }
        }
        if let Some(b) = env_bool("SV_SPARSED_VOLUMES") {
            cfg.sparsed_volumes = b;
        }

        // ----- admission -----
        if let Some(s) = env_string("SV_USED_RATIO") {
            if let Ok(v) = s.parse::<f64>() {
                cfg.used_ratio = v;
            }
        }
        if let Some(s) = env_string("SV_OVERSUB_RATIO") {
            if let Ok(v) = s.parse::<f64>() {
                cfg.oversub_ratio = v;
            }
        }

        // ----- mounts -----
        if let Some(s) = env_string("SV_MOUNT_POINT_BASE") {
            cfg.mount_point_base = PathBuf::from(s);
        }
        if let Some(s) = env_string("SV_MOUNT_OPTIONS") {
            cfg.mount_options = s;
        }

        // ----- image cache -----
        if let Some(s) = env_string("SV_IMAGE_CACHE_DIR") {
            cfg.image_cache_dir = PathBuf::from(s);
        }
        if let Some(b) = env_bool("SV_CACHE_FETCHED_IMAGES") {
            cfg.cache_fetched_images = b;
        }
        if let Some(b) = env_bool("SV_CACHE_AT_DESTINATION") {
            cfg.cache_at_destination = b;
        }

        if let Some(s) = env_string("SV_QEMU_IMG") {
            cfg.qemu_img_path = PathBuf::from(s);
        }
        if let Some(s) = env_string("SV_BLOCK_SIZE") {
            if let Ok(n) = s.parse::<u64>() {
                cfg.block_size = n;
            }
        }

        cfg
    }

    /// Reject ratios the admission math cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.oversub_ratio > 0.0) {
            return Err(DriverError::InvalidConfig(format!(
                "oversub_ratio must be > 0, got {}",
                self.oversub_ratio
            ))
            .into());
        }
        if !(self.used_ratio > 0.0 && self.used_ratio <= 1.0) {
            return Err(DriverError::InvalidConfig(format!(
                "used_ratio must be > 0 and <= 1.0, got {}",
                self.used_ratio
            ))
            .into());
        }
        Ok(())
    }

    pub fn with_shares_config<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.shares_config = p.into();
        self
    }

    pub fn with_default_volume_format(mut self, f: VolumeFormat) -> Self {
        self.default_volume_format = f;
        self
    }

    pub fn with_sparsed_volumes(mut self, on: bool) -> Self {
        self.sparsed_volumes = on;
        self
    }

    pub fn with_used_ratio(mut self, r: f64) -> Self {
        self.used_ratio = r;
        self
    }

    pub fn with_oversub_ratio(mut self, r: f64) -> Self {
        self.oversub_ratio = r;
        self
    }

    pub fn with_mount_point_base<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.mount_point_base = p.into();
        self
    }

    pub fn with_image_cache_dir<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.image_cache_dir = p.into();
        self
    }

    pub fn with_cache_fetched_images(mut self, on: bool) -> Self {
        self.cache_fetched_images = on;
        self
    }

    pub fn with_cache_at_destination(mut self, on: bool) -> Self {
        self.cache_at_destination = on;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }
}

impl fmt::Display for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DriverConfig {{ \
             shares_config: {}, \
             default_volume_format: {}, \
             sparsed_volumes: {}, \
             used_ratio: {}, \
             oversub_ratio: {}, \
             mount_point_base: {}, \
             image_cache_dir: {}, \
             cache_fetched_images: {}, \
             cache_at_destination: {}, \
             qemu_img: {} \
             }}",
            self.shares_config.display(),
            self.default_volume_format,
            self.sparsed_volumes,
            self.used_ratio,
            self.oversub_ratio,
            self.mount_point_base.display(),
            self.image_cache_dir.display(),
            self.cache_fetched_images,
            self.cache_at_destination,
            self.qemu_img_path.display(),
        )
    }
}

/// Lightweight builder that produces a `DriverConfig`.
#[derive(Clone, Debug)]
pub struct DriverBuilder {
    cfg: DriverConfig,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: DriverConfig::from_env(),
        }
    }
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: DriverConfig::default(),
        }
    }

    pub fn shares_config<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.cfg.shares_config = p.into();
        self
    }

    pub fn used_ratio(mut self, r: f64) -> Self {
        self.cfg.used_ratio = r;
        self
    }

    pub fn oversub_ratio(mut self, r: f64) -> Self {
        self.cfg.oversub_ratio = r;
        self
    }

    pub fn mount_point_base<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.cfg.mount_point_base = p.into();
        self
    }

    pub fn image_cache_dir<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.cfg.image_cache_dir = p.into();
        self
    }

    pub fn cache_fetched_images(mut self, on: bool) -> Self {
        self.cfg.cache_fetched_images = on;
        self
    }

    pub fn cache_at_destination(mut self, on: bool) -> Self {
        self.cfg.cache_at_destination = on;
        self
    }

    pub fn default_volume_format(mut self, f: VolumeFormat) -> Self {
        self.cfg.default_volume_format = f;
        self
    }

    pub fn qemu_img_path<P: Into<PathBuf>>(mut self, p: P) -> Self {
        self.cfg.qemu_img_path = p.into();
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> DriverConfig {
        self.cfg
    }
}
