use anyhow::Result;
use serde_json::json;

use crate::util::{open_driver, print_json};

/// Mount the configured shares, print each share's verdict and the pick.
pub fn exec(size_gib: u64, json: bool) -> Result<()> {
    let driver = open_driver()?;
    driver.do_setup()?;

    let rows = driver.admission_report(size_gib)?;
    let pick = driver.find_share(size_gib);

    if json {
        let shares: Vec<_> = rows
            .iter()
            .map(|(s, c, v)| json!({ "share": s, "capacity": c, "admission": v }))
            .collect();
        return print_json(&json!({
            "size_gib": size_gib,
            "shares": shares,
            "selected": pick.as_ref().ok(),
            "error": pick.as_ref().err().map(|e| format!("{:#}", e)),
        }));
    }

    if rows.is_empty() {
        println!("(no mounted shares)");
    }
    for (s, c, v) in &rows {
        println!(
            "{}  total={} available={} allocated={}  {:?}",
            s, c.total, c.available, c.allocated, v
        );
    }
    println!("selected: {}", pick?);
    Ok(())
}
