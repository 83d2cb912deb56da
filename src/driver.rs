//! ShareDriver: volume operations on top of mounted network shares.
//!
//! Every volume is a file `<mount point of provider_location>/<name>[.vhd|.vhdx]`, plus
//! snapshot children and a `<file>.info` record next to it.
//!
//! Locking: chain-mutating operations take the volume's keyed guard (key = volume id) and
//! then the `<volume_path>.lock` file lock, for the whole read-modify-write of the record.
//! Internal helpers never lock, so a clone can create and delete its temporary snapshot
//! inside the one guard it already holds.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::capacity::FsCapacityProbe;
use crate::catalog::{ImageCatalog, ImageMeta};
use crate::chain::BackingNode;
use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::image_tool::{ImageTool, QemuImg};
use crate::imagecache::ImageCache;
use crate::info::delete_info;
use crate::lock::{KeyedGuard, KeyedLocks, VolumeFileLock};
use crate::metrics::record_image_resize;
use crate::model::{Snapshot, SnapshotStatus, Volume, VolumeFormat};
use crate::mount::{CifsMountClient, MountClient};
use crate::shares::{
    check_admission, is_share_eligible, load_shares_config, select_share, Admission,
    AdmissionPolicy, CapacityProbe, ShareCapacity, ShareEntry, GIB,
};
use crate::snapshots::{self, DeleteOutcome, ReconcileReport, VolumeChain};
use crate::util::{remove_file_if_exists, set_rw_permissions_for_all};

pub const DRIVER_VOLUME_TYPE: &str = "smbfs";

/// First image-tool version that handles vhdx.
const VHDX_MIN_VERSION: [u32; 2] = [1, 7];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionData {
    pub export: String,
    /// Active image file name, relative to the mounted export.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: ConnectionData,
    pub mount_point_base: PathBuf,
}

struct VolumeLock {
    _file: VolumeFileLock,
    _key: KeyedGuard,
}

pub struct ShareDriver {
    cfg: DriverConfig,
    tool: Arc<dyn ImageTool>,
    mounts: Arc<dyn MountClient>,
    probe: Arc<dyn CapacityProbe>,
    cache: ImageCache,
    locks: KeyedLocks,
    /// Configured shares in declaration order.
    shares: RwLock<Vec<ShareEntry>>,
    /// Subset of `shares` that mounted successfully, same order.
    mounted: RwLock<Vec<String>>,
}

impl ShareDriver {
    pub fn new(
        cfg: DriverConfig,
        tool: Arc<dyn ImageTool>,
        mounts: Arc<dyn MountClient>,
        probe: Arc<dyn CapacityProbe>,
    ) -> Self {
        let cache = ImageCache::from_config(tool.clone(), &cfg);
        Self {
            cfg,
            tool,
            mounts,
            probe,
            cache,
            locks: KeyedLocks::new(),
            shares: RwLock::new(Vec::new()),
            mounted: RwLock::new(Vec::new()),
        }
    }

    /// Driver wired to `qemu-img`, `mount -t cifs` and statvfs.
    pub fn from_config(cfg: DriverConfig) -> Self {
        let tool: Arc<dyn ImageTool> = Arc::new(QemuImg::new(cfg.qemu_img_path.clone()));
        let mounts: Arc<dyn MountClient> = Arc::new(CifsMountClient::new(
            cfg.mount_point_base.clone(),
            &cfg.mount_options,
        ));
        let probe: Arc<dyn CapacityProbe> = Arc::new(FsCapacityProbe::new(mounts.clone()));
        Self::new(cfg, tool, mounts, probe)
    }

    /// Share a lock registry with other components (e.g. a second driver instance).
    pub fn with_locks(mut self, locks: KeyedLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.cfg
    }

    pub fn image_cache(&self) -> &ImageCache {
        &self.cache
    }

    // ---------------- setup / shares ----------------

    /// Validate the configuration, load the shares file and mount every share.
    pub fn do_setup(&self) -> Result<()> {
        self.cfg.validate()?;
        let entries = load_shares_config(&self.cfg.shares_config)?;
        info!(
            "driver: {} share(s) configured in {}",
            entries.len(),
            self.cfg.shares_config.display()
        );
        self.set_shares(entries);
        self.ensure_shares_mounted();
        Ok(())
    }

    pub fn set_shares(&self, entries: Vec<ShareEntry>) {
        let mut shares = self.shares.write().unwrap_or_else(|p| p.into_inner());
        *shares = entries;
    }

    pub fn shares(&self) -> Vec<ShareEntry> {
        self.shares
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn mounted_shares(&self) -> Vec<String> {
        self.mounted
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn share_options(&self, share: &str) -> Option<String> {
        self.shares
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|e| e.address == share)
            .and_then(|e| e.options.clone())
    }

    /// Mount every configured share; failures are logged and leave the share out.
    pub fn ensure_shares_mounted(&self) {
        let mut ok = Vec::new();
        for entry in self.shares() {
            match self.mounts.mount(&entry.address, entry.options.as_deref()) {
                Ok(()) => ok.push(entry.address),
                Err(e) => warn!("driver: exception while mounting {}: {:#}", entry.address, e),
            }
        }
        debug!("driver: available shares {:?}", ok);
        let mut mounted = self.mounted.write().unwrap_or_else(|p| p.into_inner());
        *mounted = ok;
    }

    pub fn ensure_share_mounted(&self, share: &str) -> Result<()> {
        let opts = self.share_options(share);
        self.mounts.mount(share, opts.as_deref())
    }

    /// Least-allocated mounted share that admits `size_gib`.
    pub fn find_share(&self, size_gib: u64) -> Result<String> {
        let policy = AdmissionPolicy::from_config(&self.cfg);
        select_share(self.probe.as_ref(), &policy, &self.mounted_shares(), size_gib)
    }

    /// Fresh capacity and admission verdict for every mounted share.
    pub fn admission_report(&self, size_gib: u64) -> Result<Vec<(String, ShareCapacity, Admission)>> {
        let policy = AdmissionPolicy::from_config(&self.cfg);
        let mut rows = Vec::new();
        for share in self.mounted_shares() {
            let cap = self
                .probe
                .capacity(&share)
                .with_context(|| format!("capacity of {}", share))?;
            let verdict = check_admission(&cap, &policy, size_gib.saturating_mul(GIB));
            rows.push((share, cap, verdict));
        }
        Ok(rows)
    }

    // ---------------- paths ----------------

    pub fn volume_format(&self, volume: &Volume) -> VolumeFormat {
        volume.format.unwrap_or(self.cfg.default_volume_format)
    }

    pub fn local_volume_dir(&self, volume: &Volume) -> Result<PathBuf> {
        Ok(self.mounts.mount_point(volume.location()?))
    }

    pub fn local_path(&self, volume: &Volume) -> Result<PathBuf> {
        let mut name = volume.name.clone();
        if let Some(ext) = self.volume_format(volume).extension() {
            name.push('.');
            name.push_str(ext);
        }
        Ok(self.local_volume_dir(volume)?.join(name))
    }

    pub fn info_path(&self, volume: &Volume) -> Result<PathBuf> {
        Ok(crate::info::info_path(&self.local_path(volume)?))
    }

    fn chain(&self, volume: &Volume) -> Result<VolumeChain<'_>> {
        VolumeChain::new(
            self.tool.as_ref(),
            &self.local_path(volume)?,
            self.volume_format(volume),
        )
    }

    /// File name of the image the guest writes to.
    pub fn active_image(&self, volume: &Volume) -> Result<String> {
        self.chain(volume)?.active_filename()
    }

    /// Backing chain from the active image to the root.
    pub fn backing_chain(&self, volume: &Volume) -> Result<Vec<BackingNode>> {
        let chain = self.chain(volume)?;
        let record = chain.read_info(true)?;
        chain.walk(&record)
    }

    fn lock_volume(&self, volume: &Volume) -> Result<VolumeLock> {
        let key = self.locks.lock(&volume.id);
        let mut lock_path = self.local_path(volume)?.into_os_string();
        lock_path.push(".lock");
        let file = VolumeFileLock::acquire(Path::new(&lock_path))?;
        Ok(VolumeLock {
            _file: file,
            _key: key,
        })
    }

    fn require_vhdx_support(&self) -> Result<()> {
        if let Some(v) = self.tool.version()? {
            if v.as_slice() < &VHDX_MIN_VERSION[..] {
                return Err(DriverError::UnsupportedFormat(format!(
                    "image tool {:?} does not support vhdx, 1.7 or newer is required",
                    v
                ))
                .into());
            }
        }
        Ok(())
    }

    // ---------------- volumes ----------------

    /// Place the volume on a share and create its file. Returns the chosen share.
    pub fn create_volume(&self, volume: &mut Volume) -> Result<String> {
        volume.validate()?;
        self.ensure_shares_mounted();
        let share = self.find_share(volume.size_gib)?;
        volume.provider_location = Some(share.clone());
        self.do_create_volume(volume)?;
        Ok(share)
    }

    fn do_create_volume(&self, volume: &Volume) -> Result<()> {
        let fmt = self.volume_format(volume);
        let path = self.local_path(volume)?;
        let bytes = volume.size_gib.saturating_mul(GIB);
        debug!("driver: creating new volume at {}", path.display());

        if path.exists() {
            return Err(DriverError::InvalidVolumeState(format!(
                "file already exists at {}",
                path.display()
            ))
            .into());
        }

        match fmt {
            VolumeFormat::Vhd | VolumeFormat::Vhdx | VolumeFormat::Qcow2 => {
                if fmt == VolumeFormat::Vhdx {
                    self.require_vhdx_support()?;
                }
                self.tool
                    .create(&path, fmt.tool_name(), Some(bytes), None)
                    .with_context(|| format!("create {} image {}", fmt, path.display()))?;
            }
            VolumeFormat::Raw if self.cfg.sparsed_volumes => create_sparse_file(&path, bytes)?,
            VolumeFormat::Raw => create_regular_file(&path, bytes, self.cfg.block_size)?,
        }

        set_rw_permissions_for_all(&path)?;
        info!(
            "driver: created volume={} path={} format={} size={}GiB",
            volume.id,
            path.display(),
            fmt,
            volume.size_gib
        );
        Ok(())
    }

    /// Remove every chain file, the record and the lock file.
    pub fn delete_volume(&self, volume: &Volume) -> Result<()> {
        let Some(share) = volume.provider_location.as_deref() else {
            warn!(
                "driver: volume {} has no provider_location, skipping delete",
                volume.name
            );
            return Ok(());
        };
        self.ensure_share_mounted(share)?;

        let lock = self.lock_volume(volume)?;
        let chain = self.chain(volume)?;
        let record = chain.read_info(true)?;

        let mut files: BTreeSet<String> = record.as_map().values().cloned().collect();
        files.insert(chain.volume_filename().to_string());
        for f in &files {
            let p = chain.path_of(f);
            if p.exists() {
                remove_file_if_exists(&p)?;
            } else {
                debug!("driver: skipping {} as it does not exist", p.display());
            }
        }
        delete_info(&chain.info_path())?;
        drop(lock);

        let mut lock_path = chain.volume_path().as_os_str().to_os_string();
        lock_path.push(".lock");
        let _ = remove_file_if_exists(Path::new(&lock_path));
        info!("driver: deleted volume={} files={:?}", volume.id, files);
        Ok(())
    }

    pub fn create_snapshot(&self, snapshot: &Snapshot) -> Result<String> {
        let _lock = self.lock_volume(&snapshot.volume)?;
        let chain = self.chain(&snapshot.volume)?;
        snapshots::create_snapshot(&chain, snapshot)
    }

    pub fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<DeleteOutcome> {
        let _lock = self.lock_volume(&snapshot.volume)?;
        let chain = self.chain(&snapshot.volume)?;
        snapshots::delete_snapshot(&chain, snapshot)
    }

    /// Re-derive the `active` pointer from on-disk backing references.
    pub fn reconcile_active(&self, volume: &Volume, dry_run: bool) -> Result<ReconcileReport> {
        let _lock = self.lock_volume(volume)?;
        let chain = self.chain(volume)?;
        snapshots::reconcile_active(&chain, dry_run)
    }

    /// Grow a volume without snapshots to `new_size_gib`.
    pub fn extend_volume(&self, volume: &Volume, new_size_gib: u64) -> Result<()> {
        info!("driver: extending volume {} to {}GiB", volume.id, new_size_gib);
        let _lock = self.lock_volume(volume)?;
        let chain = self.chain(volume)?;
        let path = chain.volume_path().to_path_buf();

        let record = chain.read_info(true)?;
        let img = self
            .tool
            .info(&path)
            .with_context(|| format!("inspect {}", path.display()))?;
        if record.snapshot_count() > 0 || img.backing_file.is_some() {
            return Err(DriverError::InvalidVolumeState(format!(
                "extend of volume {} is only supported when no snapshots exist",
                volume.id
            ))
            .into());
        }
        if new_size_gib < volume.size_gib {
            return Err(DriverError::InvalidVolumeState(format!(
                "volume {} cannot shrink from {}GiB to {}GiB",
                volume.id, volume.size_gib, new_size_gib
            ))
            .into());
        }

        let extend_by = new_size_gib - volume.size_gib;
        let policy = AdmissionPolicy::from_config(&self.cfg);
        if !is_share_eligible(self.probe.as_ref(), &policy, volume.location()?, extend_by)? {
            return Err(DriverError::NoEligibleShare {
                size_gib: extend_by,
            })
            .with_context(|| format!("insufficient space to extend volume {}", volume.id));
        }

        self.tool
            .resize(&path, new_size_gib.saturating_mul(GIB))
            .with_context(|| format!("resize {}", path.display()))?;
        record_image_resize();

        let got = self.tool.info(&path)?.virtual_size;
        if got != new_size_gib.saturating_mul(GIB) {
            return Err(DriverError::SizeMismatch(format!(
                "resizing {} failed: virtual size is {} bytes, expected {}GiB",
                path.display(),
                got,
                new_size_gib
            ))
            .into());
        }
        Ok(())
    }

    /// Upload the volume content; a volume with snapshots is flattened to a temp image first.
    pub fn copy_volume_to_image(
        &self,
        volume: &Volume,
        catalog: &dyn ImageCatalog,
        meta: &ImageMeta,
    ) -> Result<()> {
        let _lock = self.lock_volume(volume)?;
        let chain = self.chain(volume)?;
        let active_path = chain.active_path()?;
        let img = self
            .tool
            .info(&active_path)
            .with_context(|| format!("inspect {}", active_path.display()))?;

        let temp = img.backing_file.as_ref().map(|_| {
            chain
                .volume_dir()
                .join(format!("{}.temp_image.{}", volume.id, meta.id))
        });

        let res = (|| -> Result<()> {
            let upload_path = match &temp {
                Some(t) => {
                    self.tool
                        .convert(&active_path, t, &img.format, None)
                        .with_context(|| format!("flatten {}", active_path.display()))?;
                    t.as_path()
                }
                None => active_path.as_path(),
            };
            catalog.upload(meta, upload_path, &img.format)
        })();

        if let Some(t) = &temp {
            if let Err(e) = remove_file_if_exists(t) {
                warn!("driver: cannot remove temp image {}: {:#}", t.display(), e);
            }
        }
        res
    }

    /// New volume with the content the source volume had when `snapshot` was taken.
    pub fn create_volume_from_snapshot(
        &self,
        volume: &mut Volume,
        snapshot: &Snapshot,
    ) -> Result<String> {
        if snapshot.status != SnapshotStatus::Available {
            return Err(DriverError::InvalidSnapshotState(format!(
                "snapshot {} status must be \"available\" to clone (is {})",
                snapshot.id, snapshot.status
            ))
            .into());
        }
        volume.validate()?;
        let _lock = self.lock_volume(&snapshot.volume)?;

        self.ensure_shares_mounted();
        let share = self.find_share(volume.size_gib)?;
        volume.provider_location = Some(share.clone());

        self.do_create_volume(volume)?;
        self.copy_volume_from_snapshot(snapshot, volume)?;
        Ok(share)
    }

    fn copy_volume_from_snapshot(&self, snapshot: &Snapshot, volume: &Volume) -> Result<()> {
        debug!(
            "driver: snapshot={} volume={} volume_size={}",
            snapshot.id, volume.id, snapshot.volume_size
        );
        let src = self.chain(&snapshot.volume)?;
        let record = src.read_info(false)?;
        let forward = record.get(&snapshot.id).ok_or_else(|| {
            DriverError::NotFound(format!(
                "snapshot {} in {}",
                snapshot.id,
                src.info_path().display()
            ))
        })?;
        let forward_path = src.path_of(forward);

        // The file the snapshot's child backs onto holds the point-in-time content.
        let point_in_time = self
            .tool
            .info(&forward_path)
            .with_context(|| format!("inspect {}", forward_path.display()))?
            .backing_filename()
            .ok_or_else(|| {
                DriverError::ChainCorruption(format!("{} has no backing file", forward))
            })?;
        let src_path = src.path_of(&point_in_time);
        let dst_path = self.local_path(volume)?;
        debug!("driver: copying from snapshot image {}", src_path.display());

        self.tool
            .convert(
                &src_path,
                &dst_path,
                self.volume_format(volume).tool_name(),
                None,
            )
            .with_context(|| format!("convert {} -> {}", src_path.display(), dst_path.display()))?;
        set_rw_permissions_for_all(&dst_path)
    }

    /// Clone `src` into `volume` on the same share through a temporary snapshot.
    pub fn create_cloned_volume(&self, volume: &mut Volume, src: &Volume) -> Result<String> {
        info!("driver: cloning volume {} to volume {}", src.id, volume.id);
        src.validate()?;
        src.require_available("clone")?;
        volume.validate()?;

        let share = src.location()?.to_string();
        volume.provider_location = Some(share.clone());
        let dst_path = self.local_path(volume)?;
        if dst_path.exists() {
            return Err(DriverError::InvalidVolumeState(format!(
                "file already exists at {}",
                dst_path.display()
            ))
            .into());
        }

        let _lock = self.lock_volume(src)?;
        let chain = self.chain(src)?;
        let temp = Snapshot {
            id: format!("tmp-snap-{}", src.id),
            volume: src.clone(),
            status: SnapshotStatus::Available,
            volume_size: src.size_gib,
        };

        snapshots::create_snapshot(&chain, &temp)?;
        let copied = self.copy_volume_from_snapshot(&temp, volume);
        let cleaned = snapshots::delete_snapshot(&chain, &temp);

        match (copied, cleaned) {
            (Ok(()), Ok(_)) => Ok(share),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(
                    "driver: temporary snapshot {} left behind: {:#}",
                    temp.id, cleanup
                );
                Err(e)
            }
        }
    }

    /// Fill a placed volume with image `image_id` at the volume's size.
    pub fn copy_image_to_volume(
        &self,
        volume: &Volume,
        catalog: &dyn ImageCatalog,
        image_id: &str,
    ) -> Result<()> {
        let fmt = self.volume_format(volume);
        let meta = catalog.show(image_id)?;
        if fmt == VolumeFormat::Vhdx
            && meta.disk_format.as_deref().and_then(VolumeFormat::parse) != Some(VolumeFormat::Vhdx)
        {
            self.require_vhdx_support()?;
        }

        let path = self.local_path(volume)?;
        self.cache
            .get_image(catalog, image_id, &path, fmt, volume.size_gib, None)?;

        let virt = self.tool.info(&path)?.virtual_size;
        if virt / GIB != volume.size_gib {
            return Err(DriverError::SizeMismatch(format!(
                "image {}: expected volume size {}GiB but size is now {}GiB",
                image_id,
                volume.size_gib,
                virt / GIB
            ))
            .into());
        }
        set_rw_permissions_for_all(&path)
    }

    pub fn initialize_connection(&self, volume: &Volume) -> Result<ConnectionInfo> {
        let export = volume.location()?.to_string();
        let name = self.active_image(volume)?;
        Ok(ConnectionInfo {
            driver_volume_type: DRIVER_VOLUME_TYPE.to_string(),
            data: ConnectionData {
                options: self.share_options(&export),
                export,
                name,
            },
            mount_point_base: self.cfg.mount_point_base.clone(),
        })
    }
}

fn create_sparse_file(path: &Path, bytes: u64) -> Result<()> {
    let f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    f.set_len(bytes)
        .with_context(|| format!("truncate {} to {}", path.display(), bytes))?;
    Ok(())
}

fn create_regular_file(path: &Path, bytes: u64, block_size: u64) -> Result<()> {
    let mut f = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    let block = vec![0u8; block_size.max(4096) as usize];
    let mut left = bytes;
    while left > 0 {
        let n = left.min(block.len() as u64) as usize;
        f.write_all(&block[..n])?;
        left -= n as u64;
    }
    f.sync_all()?;
    Ok(())
}
