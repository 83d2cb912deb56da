// Crash recovery for the `active` pointer.
//
// A crash between an image-tool call and the record write leaves `active` naming a file
// that was committed away, or a file that already has a successor. The guest-writable
// image is the one nobody backs onto, so it is re-derived from the files the record
// references (plus the root). Files that no longer exist are skipped.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use super::VolumeChain;
use crate::error::DriverError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub previous: Option<String>,
    pub active: String,
    pub changed: bool,
    /// Snapshot ids whose file is missing on disk.
    pub dangling: Vec<String>,
    pub dry_run: bool,
}

pub fn reconcile_active(chain: &VolumeChain<'_>, dry_run: bool) -> Result<ReconcileReport> {
    let mut record = chain.read_info(true)?;
    let previous = record.active().map(str::to_string);

    let mut referenced: BTreeSet<String> = record.as_map().values().cloned().collect();
    referenced.insert(chain.volume_filename().to_string());

    let mut present: Vec<String> = Vec::new();
    let mut backed: HashSet<String> = HashSet::new();
    for f in &referenced {
        let p = chain.path_of(f);
        if !p.exists() {
            continue;
        }
        let img = chain
            .tool()
            .info(&p)
            .with_context(|| format!("inspect {}", p.display()))?;
        if let Some(b) = img.backing_filename() {
            backed.insert(b);
        }
        present.push(f.clone());
    }

    let dangling: Vec<String> = record
        .snapshots()
        .filter(|(_, f)| !chain.path_of(f).exists())
        .map(|(id, _)| id.to_string())
        .collect();

    let tips: Vec<&String> = present.iter().filter(|f| !backed.contains(*f)).collect();
    let active = match tips.as_slice() {
        [one] => (*one).clone(),
        [] => {
            return Err(DriverError::ChainCorruption(format!(
                "no image without a successor among {:?}",
                present
            ))
            .into())
        }
        many => {
            return Err(DriverError::ChainCorruption(format!(
                "several images without a successor: {:?}",
                many
            ))
            .into())
        }
    };

    let changed = previous.as_deref().unwrap_or(chain.volume_filename()) != active;
    if !dangling.is_empty() {
        warn!(
            "reconcile: {} lists missing files for snapshots {:?}",
            chain.info_path().display(),
            dangling
        );
    }
    if changed && !dry_run {
        record.set_active(&active);
        chain.write_info(&record)?;
        info!(
            "reconcile: {} active {:?} -> {}",
            chain.info_path().display(),
            previous,
            active
        );
    }

    Ok(ReconcileReport {
        previous,
        active,
        changed,
        dangling,
        dry_run,
    })
}
