use clap::{Args, Parser, Subcommand};

/// CLI for inspecting and mutating volume backing chains on mounted shares.
#[derive(Parser, Debug)]
#[command(name = "sharevol", version, about = "ShareVol backing-chain CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,

    /// Print the driver counters after the command
    #[arg(long, global = true, default_value_t = false)]
    pub metrics: bool,
}

/// Which volume to operate on. The share must already be mounted.
#[derive(Args, Debug, Clone)]
pub struct VolumeArgs {
    /// Share address (//host/export)
    #[arg(long)]
    pub share: String,
    /// Volume file name on the share (without .vhd/.vhdx extension)
    #[arg(long)]
    pub name: String,
    /// Volume id (lock key); defaults to the name
    #[arg(long)]
    pub id: Option<String>,
    /// raw|qcow2|vhd|vhdx (default: SV_DEFAULT_VOLUME_FORMAT)
    #[arg(long)]
    pub format: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub size_gib: u64,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print the info record and the active image
    Info {
        #[command(flatten)]
        vol: VolumeArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Walk the backing chain from the active image to the root
    Chain {
        #[command(flatten)]
        vol: VolumeArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Stack a new snapshot on top of the active image
    SnapshotCreate {
        #[command(flatten)]
        vol: VolumeArgs,
        #[arg(long)]
        snapshot_id: String,
    },
    /// Merge a snapshot out of the chain (no-op if unknown)
    SnapshotDelete {
        #[command(flatten)]
        vol: VolumeArgs,
        #[arg(long)]
        snapshot_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Mount configured shares and show where a volume of the given size would go
    SelectShare {
        #[arg(long)]
        size_gib: u64,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Re-derive the active image after an interrupted chain operation
    Reconcile {
        #[command(flatten)]
        vol: VolumeArgs,
        /// Report only, do not rewrite the record
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
