use anyhow::{anyhow, Result};

use ShareVol::{DriverConfig, ShareDriver, Volume, VolumeFormat};

use crate::cli::VolumeArgs;

/// Driver over the real collaborators, configured from `SV_*`.
pub fn open_driver() -> Result<ShareDriver> {
    let cfg = DriverConfig::from_env();
    cfg.validate()?;
    Ok(ShareDriver::from_config(cfg))
}

pub fn volume_from(args: &VolumeArgs) -> Result<Volume> {
    let id = args.id.clone().unwrap_or_else(|| args.name.clone());
    let mut v = Volume::new(&id, &args.name, args.size_gib).with_location(&args.share);
    if let Some(f) = &args.format {
        let fmt = VolumeFormat::parse(f).ok_or_else(|| anyhow!("unknown volume format '{}'", f))?;
        v = v.with_format(fmt);
    }
    v.validate()?;
    Ok(v)
}

pub fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
