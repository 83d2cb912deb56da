use anyhow::{Context, Result};
use log::{info, warn};

use super::VolumeChain;
use crate::error::DriverError;
use crate::metrics::record_snapshot_created;
use crate::model::{Snapshot, VolumeFormat};
use crate::util::{remove_file_if_exists, set_rw_permissions_for_all};

/// Stack a new qcow2 child on top of the active image and make it active.
///
/// Returns the new file name. On failure after the child was created the child is removed
/// (best-effort) and the info record is left as it was.
pub fn create_snapshot(chain: &VolumeChain<'_>, snapshot: &Snapshot) -> Result<String> {
    snapshot.validate()?;
    snapshot.volume.require_available("snapshot creation")?;

    if !chain.format().supports_snapshots() {
        return Err(DriverError::UnsupportedFormat(format!(
            "volume {} is {}; snapshots need a format that accepts differencing children",
            snapshot.volume.id,
            chain.format()
        ))
        .into());
    }

    let mut record = chain.read_info(true)?;
    if record.contains(&snapshot.id) {
        return Err(DriverError::InvalidSnapshotState(format!(
            "snapshot {} already exists for volume {}",
            snapshot.id, snapshot.volume.id
        ))
        .into());
    }

    let active = record
        .active()
        .map(str::to_string)
        .unwrap_or_else(|| chain.volume_filename().to_string());
    let active_path = chain.path_of(&active);

    let new_file = chain.snapshot_filename(&snapshot.id);
    let new_path = chain.path_of(&new_file);
    if new_path.exists() {
        return Err(DriverError::InvalidSnapshotState(format!(
            "snapshot file {} already exists",
            new_path.display()
        ))
        .into());
    }

    chain
        .tool()
        .create(
            &new_path,
            VolumeFormat::Qcow2.tool_name(),
            None,
            Some(&active_path),
        )
        .with_context(|| format!("create snapshot image {}", new_path.display()))?;

    let pinned = (|| -> Result<()> {
        let backing_fmt = chain.tool().info(&active_path)?.format;
        // Pin a relative backing name so the chain survives a different mount point.
        chain.tool().rebase(&new_path, &active, &backing_fmt)?;
        set_rw_permissions_for_all(&new_path)?;

        record.insert(&snapshot.id, &new_file);
        record.set_active(&new_file);
        chain.write_info(&record)
    })();

    if let Err(e) = pinned {
        warn!(
            "snapshots: create {} failed after image creation, removing {}: {:#}",
            snapshot.id,
            new_path.display(),
            e
        );
        let _ = remove_file_if_exists(&new_path);
        return Err(e);
    }

    record_snapshot_created();
    info!(
        "snapshots: created volume={} snapshot={} file={} backing={}",
        snapshot.volume.id, snapshot.id, new_file, active
    );
    Ok(new_file)
}
