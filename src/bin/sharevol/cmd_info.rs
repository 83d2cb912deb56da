use anyhow::Result;
use serde_json::json;

use crate::cli::VolumeArgs;
use crate::util::{open_driver, print_json, volume_from};

pub fn exec(args: VolumeArgs, json: bool) -> Result<()> {
    let driver = open_driver()?;
    let volume = volume_from(&args)?;

    let info_path = driver.info_path(&volume)?;
    let record = ShareVol::read_info(&info_path, true)?;
    let active = driver.active_image(&volume)?;

    if json {
        return print_json(&json!({
            "volume": volume.id,
            "path": driver.local_path(&volume)?,
            "info_path": info_path,
            "active": active,
            "snapshots": record.snapshots().collect::<std::collections::BTreeMap<_, _>>(),
        }));
    }

    println!("volume:    {}", volume.id);
    println!("path:      {}", driver.local_path(&volume)?.display());
    println!("info:      {}", info_path.display());
    println!("active:    {}", active);
    if record.snapshot_count() == 0 {
        println!("snapshots: (none)");
    } else {
        println!("snapshots:");
        for (id, file) in record.snapshots() {
            println!("  {} -> {}", id, file);
        }
    }
    Ok(())
}
