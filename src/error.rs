//! Error taxonomy for the driver.
//!
//! Library functions return `anyhow::Result` (context chains stay readable in the CLI),
//! while domain failures are raised as a typed `DriverError`. Callers that need to branch
//! on the kind use `DriverError::kind_of(&err)` or `err.downcast_ref::<DriverError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Volume status precondition not met (user-correctable).
    #[error("invalid volume state: {0}")]
    InvalidVolumeState(String),

    /// Snapshot status precondition not met.
    #[error("invalid snapshot state: {0}")]
    InvalidSnapshotState(String),

    /// Operation is incompatible with the volume disk format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A record handed to the store violates its own invariants (e.g. no `active` key).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Info store and on-disk backing pointers disagree.
    #[error("backing chain corruption: {0}")]
    ChainCorruption(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("no shares are mounted")]
    NoSharesAvailable,

    #[error("no suitable share found for a volume of {size_gib} GiB")]
    NoEligibleShare { size_gib: u64 },

    /// External command (image tool, mount tool) failed.
    #[error("backend command failed: {0}")]
    BackendCommandFailed(String),

    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DriverError {
    /// Find the typed error anywhere in an anyhow chain.
    pub fn kind_of(err: &anyhow::Error) -> Option<&DriverError> {
        err.chain().find_map(|e| e.downcast_ref::<DriverError>())
    }

    /// Faults that need an operator to look at the chain before retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::ChainCorruption(_)
                | DriverError::InvariantViolation(_)
                | DriverError::BackendCommandFailed(_)
        )
    }
}
