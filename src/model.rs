//! Volume/snapshot records and disk formats.
//!
//! Records are owned by the orchestration layer; the driver only validates them at the
//! boundary (`Volume::validate`) and never mutates them except for `provider_location`.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// On-disk disk-image format of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Raw,
    Qcow2,
    Vhd,
    Vhdx,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vhd => "vhd",
            Self::Vhdx => "vhdx",
        }
    }

    /// Parse a user-facing or image-tool name (`vpc` is the image tool's name for vhd).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(Self::Raw),
            "qcow2" => Some(Self::Qcow2),
            "vhd" | "vpc" => Some(Self::Vhd),
            "vhdx" => Some(Self::Vhdx),
            _ => None,
        }
    }

    /// Name understood by the image tool.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Vhd => "vpc",
            other => other.as_str(),
        }
    }

    /// Extension appended to the volume file name (raw/qcow2 carry none).
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Vhd => Some("vhd"),
            Self::Vhdx => Some("vhdx"),
            _ => None,
        }
    }

    /// Whether qcow2 differencing children can be stacked on top of this format.
    pub fn supports_snapshots(&self) -> bool {
        matches!(self, Self::Raw | Self::Qcow2)
    }

    /// Differencing vhd/vhdx children cannot be resized; their parent has to be.
    pub fn can_resize_differencing(&self) -> bool {
        !matches!(self, Self::Vhd | Self::Vhdx)
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Available,
    InUse,
    Creating,
    Deleting,
    Error,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Creating => "creating",
            Self::Deleting => "deleting",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "available" => Some(Self::Available),
            "in-use" | "in_use" => Some(Self::InUse),
            "creating" => Some(Self::Creating),
            "deleting" => Some(Self::Deleting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Available,
    Creating,
    Deleting,
    Error,
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Creating => "creating",
            Self::Deleting => "deleting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A volume as handed over by the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    /// File name on the share (without format extension).
    pub name: String,
    /// Size in GiB.
    pub size_gib: u64,
    pub status: VolumeStatus,
    /// Share address (`//host/export`) the volume lives on, once placed.
    pub provider_location: Option<String>,
    /// Explicit disk format; the configured default applies when None.
    pub format: Option<VolumeFormat>,
}

impl Volume {
    pub fn new(id: &str, name: &str, size_gib: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            size_gib,
            status: VolumeStatus::Available,
            provider_location: None,
            format: None,
        }
    }

    pub fn with_location(mut self, share: &str) -> Self {
        self.provider_location = Some(share.to_string());
        self
    }

    pub fn with_format(mut self, f: VolumeFormat) -> Self {
        self.format = Some(f);
        self
    }

    pub fn with_status(mut self, s: VolumeStatus) -> Self {
        self.status = s;
        self
    }

    /// Boundary validation: fields the driver cannot work without.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DriverError::InvalidVolumeState("volume id is empty".into()).into());
        }
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(DriverError::InvalidVolumeState(format!(
                "volume {} has an invalid name '{}'",
                self.id, self.name
            ))
            .into());
        }
        Ok(())
    }

    pub fn require_available(&self, what: &str) -> Result<()> {
        if self.status != VolumeStatus::Available {
            return Err(DriverError::InvalidVolumeState(format!(
                "volume {} status must be \"available\" for {} (is {})",
                self.id, what, self.status
            ))
            .into());
        }
        Ok(())
    }

    /// Placement, or an error for operations that need the volume to live somewhere.
    pub fn location(&self) -> Result<&str> {
        self.provider_location.as_deref().ok_or_else(|| {
            DriverError::InvalidVolumeState(format!(
                "volume {} has no provider_location",
                self.id
            ))
            .into()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume: Volume,
    pub status: SnapshotStatus,
    /// Declared size in GiB (size of the volume at snapshot time).
    pub volume_size: u64,
}

impl Snapshot {
    pub fn new(id: &str, volume: &Volume) -> Self {
        Self {
            id: id.to_string(),
            volume: volume.clone(),
            status: SnapshotStatus::Available,
            volume_size: volume.size_gib,
        }
    }

    pub fn validate(&self) -> Result<()> {
        // The id becomes part of a file name; "active" is the reserved pointer key of the record.
        if self.id.trim().is_empty()
            || self.id == crate::info::ACTIVE_KEY
            || self.id.contains(['/', '\\'])
        {
            return Err(DriverError::InvalidSnapshotState(format!(
                "invalid snapshot id '{}'",
                self.id
            ))
            .into());
        }
        self.volume.validate()
    }
}
