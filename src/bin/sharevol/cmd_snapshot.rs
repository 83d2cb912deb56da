use anyhow::Result;

use ShareVol::{DeleteOutcome, Snapshot};

use crate::cli::VolumeArgs;
use crate::util::{open_driver, print_json, volume_from};

pub fn exec_create(args: VolumeArgs, snapshot_id: String) -> Result<()> {
    let driver = open_driver()?;
    let volume = volume_from(&args)?;
    let snap = Snapshot::new(&snapshot_id, &volume);

    let file = driver.create_snapshot(&snap)?;
    println!("snapshot: id={} file={}", snapshot_id, file);
    Ok(())
}

pub fn exec_delete(args: VolumeArgs, snapshot_id: String, json: bool) -> Result<()> {
    let driver = open_driver()?;
    let volume = volume_from(&args)?;
    let snap = Snapshot::new(&snapshot_id, &volume);

    let outcome = driver.delete_snapshot(&snap)?;
    if json {
        return print_json(&outcome);
    }
    match outcome {
        DeleteOutcome::AlreadyAbsent => {
            println!("snapshot {}: not in record, nothing to do", snapshot_id)
        }
        DeleteOutcome::MergedActive { committed, active } => {
            println!("snapshot {}: committed {}; active={}", snapshot_id, committed, active)
        }
        DeleteOutcome::MergedInterior {
            committed,
            rebased,
            active,
        } => println!(
            "snapshot {}: committed {}; rebased={}; active={}",
            snapshot_id,
            committed,
            rebased.as_deref().unwrap_or("-"),
            active
        ),
    }
    Ok(())
}
