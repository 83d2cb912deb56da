use anyhow::Result;

use crate::cli::VolumeArgs;
use crate::util::{open_driver, print_json, volume_from};

pub fn exec(args: VolumeArgs, dry_run: bool, json: bool) -> Result<()> {
    let driver = open_driver()?;
    let volume = volume_from(&args)?;
    let report = driver.reconcile_active(&volume, dry_run)?;

    if json {
        return print_json(&report);
    }
    let previous = report.previous.as_deref().unwrap_or("(no record)");
    if report.changed {
        let verb = if report.dry_run { "would move" } else { "moved" };
        println!("active {}: {} -> {}", verb, previous, report.active);
    } else {
        println!("active ok: {}", report.active);
    }
    if !report.dangling.is_empty() {
        println!("snapshots with missing files: {}", report.dangling.join(", "));
    }
    Ok(())
}
