//! Filesystem-backed capacity probe.
//!
//! total/available come from statvfs (fs2) on the share's mount point. allocated is the
//! apparent size of everything on the share except files with `snapshot` in their name.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::mount::MountClient;
use crate::shares::{CapacityProbe, ShareCapacity};
use crate::util::apparent_size_excluding;

pub struct FsCapacityProbe {
    mounts: Arc<dyn MountClient>,
}

impl FsCapacityProbe {
    pub fn new(mounts: Arc<dyn MountClient>) -> Self {
        Self { mounts }
    }
}

impl CapacityProbe for FsCapacityProbe {
    fn capacity(&self, share: &str) -> Result<ShareCapacity> {
        let mp = self.mounts.mount_point(share);
        let total = fs2::total_space(&mp).with_context(|| format!("statvfs {}", mp.display()))?;
        let available =
            fs2::available_space(&mp).with_context(|| format!("statvfs {}", mp.display()))?;
        let allocated = apparent_size_excluding(&mp, "snapshot")?;
        Ok(ShareCapacity {
            total,
            available,
            allocated,
        })
    }
}
