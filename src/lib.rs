#![allow(non_snake_case)]

// Core modules
pub mod error;
pub mod config;
pub mod metrics;
pub mod model;
pub mod util;   // src/util/mod.rs
pub mod lock;

// Backing chains: info record, inspector, snapshot create/delete/reconcile
pub mod info;
pub mod image_tool;
pub mod chain;
pub mod snapshots; // src/snapshots/{mod,create,delete,reconcile}.rs

// Shares: admission/selection, mounts, capacity
pub mod shares;
pub mod mount;
pub mod capacity;

// Images
pub mod catalog;
pub mod imagecache;

// Facade
pub mod driver;

// Convenience re-exports
pub use config::{DriverBuilder, DriverConfig};
pub use driver::{ConnectionInfo, ShareDriver};
pub use error::DriverError;
pub use image_tool::{ImageInfo, ImageTool, QemuImg};
pub use info::{read_info, write_info, ChainInfo};
pub use model::{Snapshot, SnapshotStatus, Volume, VolumeFormat, VolumeStatus};
pub use shares::{select_share, CapacityProbe, ShareCapacity};
pub use snapshots::{DeleteOutcome, ReconcileReport, VolumeChain};
