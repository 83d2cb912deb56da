use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_info;
mod cmd_chain;
mod cmd_snapshot;
mod cmd_select;
mod cmd_reconcile;
mod cmd_metrics;

fn init_logger() {
    // RUST_LOG overrides; info by default.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    let with_metrics = cli.metrics;
    let res = match cli.cmd {
        cli::Cmd::Info { vol, json } =>
            cmd_info::exec(vol, json),

        cli::Cmd::Chain { vol, json } =>
            cmd_chain::exec(vol, json),

        cli::Cmd::SnapshotCreate { vol, snapshot_id } =>
            cmd_snapshot::exec_create(vol, snapshot_id),

        cli::Cmd::SnapshotDelete { vol, snapshot_id, json } =>
            cmd_snapshot::exec_delete(vol, snapshot_id, json),

        cli::Cmd::SelectShare { size_gib, json } =>
            cmd_select::exec(size_gib, json),

        cli::Cmd::Reconcile { vol, dry_run, json } =>
            cmd_reconcile::exec(vol, dry_run, json),
    };

    if with_metrics {
        cmd_metrics::print();
    }
    res
}
