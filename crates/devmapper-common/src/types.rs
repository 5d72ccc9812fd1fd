//! Core type definitions for devmapper
//!
//! Identifiers for mapped devices and the real devices underneath them,
//! plus the sector arithmetic shared by every layer.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical block address, in 512-byte sectors
pub type Sector = u64;

/// Minor number identifying one mapped device
pub type Minor = u32;

/// Sector size in bytes
pub const SECTOR_SIZE: u64 = 512;

/// log2(SECTOR_SIZE)
pub const SECTOR_SHIFT: u32 = 9;

/// Assumed L1 cache line size; index nodes are sized to fit one line
pub const CACHE_LINE_BYTES: usize = 64;

/// Keys that fit in one cache-line sized index node
pub const DEFAULT_KEYS_PER_NODE: usize = CACHE_LINE_BYTES / std::mem::size_of::<Sector>();

/// Largest supported fan-out: one 4 KiB page of keys per node
pub const MAX_KEYS_PER_NODE: usize = 4096 / std::mem::size_of::<Sector>();

/// Maximum length of a mapped device name in bytes
pub const MAX_NAME_LEN: usize = 128;

/// Convert a byte count to whole sectors (rounding up)
#[must_use]
pub const fn bytes_to_sectors(bytes: u64) -> Sector {
    bytes.div_ceil(SECTOR_SIZE)
}

/// Convert a sector count to bytes
#[must_use]
pub const fn sectors_to_bytes(sectors: Sector) -> u64 {
    sectors << SECTOR_SHIFT
}

/// Identity of an underlying real block device
///
/// Opaque to the engine; typically a path (`/dev/sdb`) or a `major:minor`
/// pair. Two targets referencing the same identity share one open handle.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:?})", self.0)
    }
}

/// Name of a mapped device
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct DeviceName(String);

impl DeviceName {
    /// Create a new device name (validates naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, DeviceNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), DeviceNameError> {
        if name.is_empty() {
            return Err(DeviceNameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(DeviceNameError::TooLong);
        }
        if name == "." || name == ".." {
            return Err(DeviceNameError::Reserved);
        }
        if let Some(c) = name.chars().find(|c| *c == '/' || *c == '\0') {
            return Err(DeviceNameError::InvalidChar(c));
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceName({:?})", self.0)
    }
}

/// Errors that can occur when creating a device name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceNameError {
    #[error("device name cannot be empty")]
    Empty,
    #[error("device name must be at most 128 bytes")]
    TooLong,
    #[error("device name cannot be '.' or '..'")]
    Reserved,
    #[error("device name contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// Direction of an I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
