//! Mapped devices
//!
//! A mapped device is a named minor with an optional bound table. Its state
//! decides how submitted I/O is handled: `Active` routes through the table,
//! anything else queues the request until the device is resumed.
//!
//! ```text
//! create ──► Created ──activate──► Active ◄──resume── Suspended
//!               ▲                    │                    ▲
//!               │                    └──────suspend───────┘
//!               └──────────────deactivate────────────────┘
//! ```

use crate::io::{IoRequest, IoStatsSnapshot, IoTracker};
use crate::table::MappingTable;
use devmapper_common::{DeviceId, DeviceName, Minor, Sector, sectors_to_bytes};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Activation state of a mapped device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// No table live; I/O is queued
    Created,
    /// Table bound and routing I/O
    Active,
    /// Table bound but not routing; I/O is queued
    Suspended,
}

impl DeviceState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }

    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mapped device
///
/// Owned by the device registry and only reached through its lock.
pub struct MappedDevice {
    pub(crate) name: DeviceName,
    pub(crate) minor: Minor,
    pub(crate) state: DeviceState,
    pub(crate) table: Option<MappingTable>,
    /// External openers of the mapped device itself
    pub(crate) open_count: u32,
    /// Underlying devices acquired on activation, released on suspend
    pub(crate) open_devices: Vec<DeviceId>,
    /// Requests that arrived while the device was not active, oldest first
    pub(crate) deferred: Mutex<VecDeque<IoRequest>>,
    pub(crate) io: Arc<IoTracker>,
    /// Serializes management operations on this device
    pub(crate) control: Arc<Mutex<()>>,
}

impl MappedDevice {
    pub(crate) fn new(name: DeviceName, minor: Minor) -> Self {
        Self {
            name,
            minor,
            state: DeviceState::Created,
            table: None,
            open_count: 0,
            open_devices: Vec::new(),
            deferred: Mutex::new(VecDeque::new()),
            io: Arc::new(IoTracker::new()),
            control: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    pub fn minor(&self) -> Minor {
        self.minor
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn table(&self) -> Option<&MappingTable> {
        self.table.as_ref()
    }

    /// Detach everything that must be released outside the registry lock
    pub(crate) fn teardown(&mut self) -> Teardown {
        self.state = DeviceState::Created;
        Teardown {
            table: self.table.take(),
            open_devices: std::mem::take(&mut self.open_devices),
            deferred: std::mem::take(self.deferred.get_mut()),
        }
    }

    pub(crate) fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.to_string(),
            minor: self.minor,
            state: self.state,
            open_count: self.open_count,
            target_count: self.table.as_ref().map_or(0, MappingTable::len),
            size: self.table.as_ref().map_or(0, MappingTable::size),
            pending: self.io.pending(),
            deferred: self.deferred.lock().len(),
            stats: self.io.stats().snapshot(),
        }
    }
}

impl fmt::Debug for MappedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedDevice")
            .field("name", &self.name)
            .field("minor", &self.minor)
            .field("state", &self.state)
            .field("table", &self.table)
            .field("open_count", &self.open_count)
            .field("deferred", &self.deferred.lock().len())
            .finish_non_exhaustive()
    }
}

/// Resources detached from a device being deactivated or removed
pub(crate) struct Teardown {
    pub(crate) table: Option<MappingTable>,
    pub(crate) open_devices: Vec<DeviceId>,
    pub(crate) deferred: VecDeque<IoRequest>,
}

/// Point-in-time view of a mapped device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub minor: Minor,
    pub state: DeviceState,
    pub open_count: u32,
    pub target_count: usize,
    /// Mapped size in sectors, 0 without a table
    pub size: Sector,
    /// Requests handed to the lower layer and not yet completed
    pub pending: usize,
    /// Requests waiting for the device to become active
    pub deferred: usize,
    pub stats: IoStatsSnapshot,
}

impl DeviceInfo {
    /// Mapped size in bytes
    pub const fn size_bytes(&self) -> u64 {
        sectors_to_bytes(self.size)
    }
}
