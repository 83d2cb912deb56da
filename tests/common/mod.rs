// tests/common/mod.rs
//
// In-memory collaborators for driver tests.
//
// FakeImageTool stores image metadata as JSON inside the image file itself, so plain
// fs::copy / fs::rename done by the driver carry the metadata along:
//   {"format":"qcow2","virtual_size":1073741824,"backing_file":"volume-1","data":["w1"]}
// Files that are not fake images (large sparse raw files) read back as raw with
// virtual_size = file length. `data` is the list of guest writes that landed in this
// layer; commit appends a child's writes to its parent, convert flattens the chain.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use ShareVol::catalog::{ImageCatalog, ImageMeta};
use ShareVol::image_tool::{ImageInfo, ImageTool};
use ShareVol::mount::MountClient;
use ShareVol::shares::{CapacityProbe, ShareCapacity, GIB};
use ShareVol::DriverError;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    let root = base.join(format!("svtest-{prefix}-{pid}-{t}-{id}"));
    fs::create_dir_all(&root).unwrap();
    root
}

// ---------------- image tool ----------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FakeImage {
    pub format: String,
    pub virtual_size: u64,
    pub backing_file: Option<String>,
    pub data: Vec<String>,
}

impl FakeImage {
    pub fn new(format: &str, virtual_size: u64) -> Self {
        Self {
            format: format.to_string(),
            virtual_size,
            backing_file: None,
            data: Vec::new(),
        }
    }
}

const MAX_META_FILE: u64 = 64 * 1024;

pub fn read_image(path: &Path) -> Result<FakeImage> {
    let md = fs::metadata(path)
        .map_err(|e| DriverError::BackendCommandFailed(format!("{}: {}", path.display(), e)))?;
    if md.len() <= MAX_META_FILE {
        let bytes = fs::read(path)?;
        if let Ok(img) = serde_json::from_slice::<FakeImage>(&bytes) {
            return Ok(img);
        }
    }
    Ok(FakeImage::new("raw", md.len()))
}

pub fn write_image(path: &Path, img: &FakeImage) -> Result<()> {
    fs::write(path, serde_json::to_vec(img)?)?;
    Ok(())
}

fn resolve_backing(path: &Path, backing: &str) -> PathBuf {
    let name = Path::new(backing)
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    path.parent().unwrap_or(Path::new(".")).join(name)
}

/// All writes visible through `path` (root first).
pub fn flatten(path: &Path) -> Result<Vec<String>> {
    let img = read_image(path)?;
    let mut out = match &img.backing_file {
        Some(b) => flatten(&resolve_backing(path, b))?,
        None => Vec::new(),
    };
    out.extend(img.data);
    Ok(out)
}

#[derive(Default)]
pub struct FakeImageTool {
    pub calls: Mutex<Vec<String>>,
    /// op name -> remaining successful calls before it fails (0 = fail now)
    fail_after: Mutex<HashMap<String, usize>>,
    pub version: Mutex<Option<Vec<u32>>>,
}

impl FakeImageTool {
    pub fn new() -> Arc<Self> {
        let t = Self::default();
        *t.version.lock().unwrap() = Some(vec![8, 2, 0]);
        Arc::new(t)
    }

    /// Make the (n+1)-th next call of `op` fail.
    pub fn fail_after(&self, op: &str, n: usize) {
        self.fail_after.lock().unwrap().insert(op.to_string(), n);
    }

    pub fn fail(&self, op: &str) {
        self.fail_after(op, 0);
    }

    pub fn clear_failures(&self) {
        self.fail_after.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    /// Simulate a guest write to the image at `path`.
    pub fn guest_write(&self, path: &Path, what: &str) -> Result<()> {
        let mut img = read_image(path)?;
        img.data.push(what.to_string());
        write_image(path, &img)
    }

    fn enter(&self, op: &str, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(format!("{} {}", op, name));
        let mut f = self.fail_after.lock().unwrap();
        if let Some(left) = f.get_mut(op) {
            if *left == 0 {
                f.remove(op);
                return Err(DriverError::BackendCommandFailed(format!("injected {} failure", op)).into());
            }
            *left -= 1;
        }
        Ok(())
    }
}

impl ImageTool for FakeImageTool {
    fn info(&self, path: &Path) -> Result<ImageInfo> {
        self.enter("info", path)?;
        let img = read_image(path)?;
        Ok(ImageInfo {
            format: img.format,
            virtual_size: img.virtual_size,
            backing_file: img.backing_file,
        })
    }

    fn create(&self, path: &Path, format: &str, size_bytes: Option<u64>, backing: Option<&Path>) -> Result<()> {
        self.enter("create", path)?;
        let size = match (size_bytes, backing) {
            (Some(s), _) => s,
            (None, Some(b)) => read_image(b)?.virtual_size,
            (None, None) => return Err(anyhow!("create without size or backing")),
        };
        let mut img = FakeImage::new(format, size);
        img.backing_file = backing.map(|b| b.to_string_lossy().into_owned());
        write_image(path, &img)
    }

    fn convert(&self, src: &Path, dst: &Path, format: &str, _subformat: Option<&str>) -> Result<()> {
        self.enter("convert", src)?;
        let top = read_image(src)?;
        let mut img = FakeImage::new(format, top.virtual_size);
        img.data = flatten(src)?;
        write_image(dst, &img)
    }

    fn resize(&self, path: &Path, size_bytes: u64) -> Result<()> {
        self.enter("resize", path)?;
        if fs::metadata(path)?.len() > MAX_META_FILE {
            let f = fs::OpenOptions::new().write(true).open(path)?;
            f.set_len(size_bytes)?;
            return Ok(());
        }
        let mut img = read_image(path)?;
        img.virtual_size = size_bytes;
        write_image(path, &img)
    }

    fn commit(&self, path: &Path) -> Result<()> {
        self.enter("commit", path)?;
        let img = read_image(path)?;
        let backing = img
            .backing_file
            .as_deref()
            .ok_or_else(|| anyhow!("commit of {} without backing file", path.display()))?;
        let parent_path = resolve_backing(path, backing);
        let mut parent = read_image(&parent_path)?;
        parent.data.extend(img.data);
        write_image(&parent_path, &parent)?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn rebase(&self, path: &Path, backing_name: &str, backing_format: &str) -> Result<()> {
        self.enter("rebase", path)?;
        let _ = backing_format;
        let mut img = read_image(path)?;
        img.backing_file = Some(backing_name.to_string());
        write_image(path, &img)
    }

    fn version(&self) -> Result<Option<Vec<u32>>> {
        Ok(self.version.lock().unwrap().clone())
    }
}

// ---------------- mounts ----------------

pub struct FakeMounts {
    pub base: PathBuf,
    pub failing: Mutex<HashSet<String>>,
    pub mounted: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeMounts {
    pub fn new(base: &Path) -> Arc<Self> {
        Arc::new(Self {
            base: base.to_path_buf(),
            failing: Mutex::new(HashSet::new()),
            mounted: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_share(&self, share: &str) {
        self.failing.lock().unwrap().insert(share.to_string());
    }
}

impl MountClient for FakeMounts {
    fn mount_point(&self, share: &str) -> PathBuf {
        self.base.join(share.trim_start_matches('/').replace('/', "_"))
    }

    fn mount(&self, share: &str, options: Option<&str>) -> Result<()> {
        if self.failing.lock().unwrap().contains(share) {
            return Err(DriverError::BackendCommandFailed(format!("cannot mount {}", share)).into());
        }
        fs::create_dir_all(self.mount_point(share))?;
        self.mounted
            .lock()
            .unwrap()
            .push((share.to_string(), options.map(str::to_string)));
        Ok(())
    }
}

// ---------------- capacity ----------------

#[derive(Default)]
pub struct StaticProbe {
    caps: Mutex<HashMap<String, ShareCapacity>>,
    pub queries: AtomicU64,
}

impl StaticProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, share: &str, total_gib: u64, available_gib: u64, allocated_gib: u64) {
        self.caps.lock().unwrap().insert(
            share.to_string(),
            ShareCapacity {
                total: total_gib * GIB,
                available: available_gib * GIB,
                allocated: allocated_gib * GIB,
            },
        );
    }

    pub fn set_raw(&self, share: &str, cap: ShareCapacity) {
        self.caps.lock().unwrap().insert(share.to_string(), cap);
    }
}

impl CapacityProbe for StaticProbe {
    fn capacity(&self, share: &str) -> Result<ShareCapacity> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.caps
            .lock()
            .unwrap()
            .get(share)
            .copied()
            .ok_or_else(|| anyhow!("no capacity for {}", share))
    }
}

// ---------------- catalog ----------------

#[derive(Default)]
pub struct FakeCatalog {
    images: Mutex<HashMap<String, (FakeImage, Option<String>)>>,
    pub fetches: AtomicU64,
    pub uploads: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image whose bytes are `img` and whose catalog disk_format is `disk_format`.
    pub fn add(&self, id: &str, img: FakeImage, disk_format: Option<&str>) {
        self.images
            .lock()
            .unwrap()
            .insert(id.to_string(), (img, disk_format.map(str::to_string)));
    }
}

impl ImageCatalog for FakeCatalog {
    fn fetch(&self, image_id: &str, dest: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let images = self.images.lock().unwrap();
        let (img, _) = images
            .get(image_id)
            .ok_or_else(|| DriverError::NotFound(format!("image {}", image_id)))?;
        write_image(dest, img)
    }

    fn show(&self, image_id: &str) -> Result<ImageMeta> {
        let images = self.images.lock().unwrap();
        let (img, fmt) = images
            .get(image_id)
            .ok_or_else(|| DriverError::NotFound(format!("image {}", image_id)))?;
        let mut meta = ImageMeta::new(image_id);
        meta.disk_format = fmt.clone();
        meta.size = Some(img.virtual_size);
        Ok(meta)
    }

    fn upload(&self, meta: &ImageMeta, path: &Path, format: &str) -> Result<()> {
        let content = flatten(path)?;
        self.uploads
            .lock()
            .unwrap()
            .push((meta.id.clone(), format.to_string(), content));
        Ok(())
    }
}
