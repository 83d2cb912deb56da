use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use super::VolumeChain;
use crate::chain::successor_of;
use crate::error::DriverError;
use crate::metrics::{record_commit, record_rebase, record_snapshot_delete_noop, record_snapshot_deleted};
use crate::model::Snapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// The id was not in the record; nothing touched.
    AlreadyAbsent,
    /// The snapshot was the active image: it was committed into its backing file,
    /// which became active.
    MergedActive { committed: String, active: String },
    /// The snapshot was interior: its successor was committed into it and the successor's
    /// id now names the snapshot's file. `rebased` is the file re-pointed at it, if any.
    MergedInterior {
        committed: String,
        rebased: Option<String>,
        active: String,
    },
}

/// Remove `snapshot` from the volume chain.
///
/// Image-tool calls all happen before the record is written, so any failure leaves the
/// record describing the pre-delete chain.
pub fn delete_snapshot(chain: &VolumeChain<'_>, snapshot: &Snapshot) -> Result<DeleteOutcome> {
    snapshot.validate()?;
    snapshot.volume.require_available("snapshot deletion")?;

    let mut record = chain.read_info(true)?;
    let snapshot_file = match record.get(&snapshot.id) {
        Some(f) => f.to_string(),
        None => {
            info!(
                "snapshots: delete volume={} snapshot={} not in record, nothing to do",
                snapshot.volume.id, snapshot.id
            );
            record_snapshot_delete_noop();
            return Ok(DeleteOutcome::AlreadyAbsent);
        }
    };
    let active = record.active().map(str::to_string).ok_or_else(|| {
        DriverError::ChainCorruption(format!(
            "record {} lists snapshot {} but has no active image",
            chain.info_path().display(),
            snapshot.id
        ))
    })?;
    let snapshot_path = chain.path_of(&snapshot_file);

    let outcome = if snapshot_file == active {
        // The guest writes to this file: fold it into its parent and make the parent active.
        let base = chain
            .tool()
            .info(&snapshot_path)
            .with_context(|| format!("inspect {}", snapshot_path.display()))?
            .backing_filename()
            .ok_or_else(|| {
                DriverError::ChainCorruption(format!(
                    "active snapshot {} has no backing file",
                    snapshot_file
                ))
            })?;

        chain
            .tool()
            .commit(&snapshot_path)
            .with_context(|| format!("commit {}", snapshot_path.display()))?;
        record_commit();

        record.remove(&snapshot.id);
        record.set_active(&base);
        DeleteOutcome::MergedActive {
            committed: snapshot_file,
            active: base,
        }
    } else {
        let nodes = chain.walk(&record)?;

        let higher_file = successor_of(&nodes, &snapshot_file)
            .map(|n| n.filename.clone())
            .ok_or_else(|| {
                DriverError::ChainCorruption(format!(
                    "no image is backed by {} in the chain from {}",
                    snapshot_file, active
                ))
            })?;
        let higher_id = record
            .id_for_file(&higher_file)
            .map(str::to_string)
            .ok_or_else(|| {
                DriverError::ChainCorruption(format!(
                    "{} backs onto {} but is not in the record",
                    higher_file, snapshot_file
                ))
            })?;
        let highest_file = successor_of(&nodes, &higher_file).map(|n| n.filename.clone());

        if higher_file == active && highest_file.is_some() {
            return Err(DriverError::InvariantViolation(format!(
                "active image {} has a successor {:?}",
                higher_file, highest_file
            ))
            .into());
        }

        let snapshot_fmt = chain
            .tool()
            .info(&snapshot_path)
            .with_context(|| format!("inspect {}", snapshot_path.display()))?
            .format;

        let higher_path = chain.path_of(&higher_file);
        chain
            .tool()
            .commit(&higher_path)
            .with_context(|| format!("commit {}", higher_path.display()))?;
        record_commit();

        if let Some(highest) = &highest_file {
            let highest_path = chain.path_of(highest);
            chain
                .tool()
                .rebase(&highest_path, &snapshot_file, &snapshot_fmt)
                .with_context(|| format!("rebase {} onto {}", highest, snapshot_file))?;
            record_rebase();
        }

        record.remove(&snapshot.id);
        record.insert(&higher_id, &snapshot_file);
        if higher_file == active {
            record.set_active(&snapshot_file);
        }
        DeleteOutcome::MergedInterior {
            committed: higher_file,
            rebased: highest_file,
            active: record.active().unwrap_or(&active).to_string(),
        }
    };

    chain.write_info(&record)?;
    record_snapshot_deleted();
    info!(
        "snapshots: deleted volume={} snapshot={} outcome={:?}",
        snapshot.volume.id, snapshot.id, outcome
    );
    Ok(outcome)
}
