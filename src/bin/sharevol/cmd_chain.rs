use anyhow::Result;
use serde_json::json;

use crate::cli::VolumeArgs;
use crate::util::{open_driver, print_json, volume_from};

pub fn exec(args: VolumeArgs, json: bool) -> Result<()> {
    let driver = open_driver()?;
    let volume = volume_from(&args)?;
    let nodes = driver.backing_chain(&volume)?;

    if json {
        let arr: Vec<_> = nodes
            .iter()
            .map(|n| json!({ "filename": n.filename, "backing_filename": n.backing_filename }))
            .collect();
        return print_json(&arr);
    }

    for (depth, n) in nodes.iter().enumerate() {
        match &n.backing_filename {
            Some(b) => println!("{:>3}  {}  ->  {}", depth, n.filename, b),
            None => println!("{:>3}  {}  (root)", depth, n.filename),
        }
    }
    Ok(())
}
