//! Backing-chain inspection.
//!
//! A chain is read by asking the image tool for the backing reference of a file, then of
//! that backing file, and so on until a file has none. References are reduced to basenames
//! and resolved against the volume directory (all chain members share one directory).

use anyhow::{Context, Result};
use log::debug;
use std::path::Path;

use crate::error::DriverError;
use crate::image_tool::{basename, ImageTool};
use crate::metrics::record_chain_walk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingNode {
    pub filename: String,
    pub backing_filename: Option<String>,
}

/// Walk from `start_path` to the chain root.
///
/// The first node is `start_path` itself, the last one has `backing_filename == None`.
/// More than `max_nodes` nodes means a cycle or a chain longer than the info record
/// accounts for, reported as `ChainCorruption`.
pub fn chain_for(
    tool: &dyn ImageTool,
    volume_dir: &Path,
    start_path: &Path,
    max_nodes: usize,
) -> Result<Vec<BackingNode>> {
    let start = start_path
        .file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            DriverError::InvalidState(format!("bad chain start {}", start_path.display()))
        })?;

    let mut out: Vec<BackingNode> = Vec::new();
    let mut current = Some(start);

    while let Some(filename) = current {
        if out.len() >= max_nodes {
            return Err(DriverError::ChainCorruption(format!(
                "chain from {} exceeds {} nodes (at {})",
                start_path.display(),
                max_nodes,
                filename
            ))
            .into());
        }
        let path = volume_dir.join(&filename);
        let info = tool
            .info(&path)
            .with_context(|| format!("inspect chain node {}", path.display()))?;
        let backing = info.backing_file.as_deref().filter(|s| !s.is_empty()).map(basename);

        debug!(
            "chain: node={} backing={}",
            filename,
            backing.as_deref().unwrap_or("-")
        );
        out.push(BackingNode {
            filename,
            backing_filename: backing.clone(),
        });
        current = backing;
    }

    record_chain_walk(out.len());
    Ok(out)
}

/// The node whose backing file is `filename` (its direct successor), if any.
pub fn successor_of<'a>(chain: &'a [BackingNode], filename: &str) -> Option<&'a BackingNode> {
    chain
        .iter()
        .find(|n| n.backing_filename.as_deref() == Some(filename))
}
