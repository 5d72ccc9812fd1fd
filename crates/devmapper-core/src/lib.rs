//! Devmapper Core
//!
//! Presents logical block devices whose address space is split into
//! contiguous ranges, each handled by a pluggable target. Every request is
//! routed to the target owning its first sector.
//!
//! # Architecture
//!
//! ```text
//!        submit(minor, request)
//!               │
//! ┌─────────────▼─────────────┐
//! │       IoDispatcher        │  shared lock; defers while inactive
//! └─────────────┬─────────────┘
//!               │
//! ┌─────────────▼─────────────┐
//! │      DeviceRegistry       │  minor → MappedDevice behind one RwLock
//! │  activate/suspend/resume  │
//! └─────────────┬─────────────┘
//!               │
//! ┌─────────────▼─────────────┐
//! │       MappingTable        │  sector → target via a static B-tree
//! └─────────────┬─────────────┘
//!               │ Target::map
//! ┌─────────────▼─────────────┐
//! │          IoSink           │  lower layer, completes each request
//! └───────────────────────────┘
//! ```
//!
//! Target types (`linear`, `error`, `striped` built in) are registered by
//! name in a `TargetRegistry`; tables are built from `TargetSpec` lines with
//! `load_table` and bound to devices wholesale.

pub mod device;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod io;
mod lifecycle;
pub mod loader;
pub mod mapper;
pub mod registry;
pub mod table;
pub mod target;
pub mod targets;

pub use device::{DeviceInfo, DeviceState, MappedDevice};
pub use devices::{DeviceProvider, NullDeviceProvider, OpenDeviceTable};
pub use dispatch::IoDispatcher;
pub use error::{IoError, IoStatus, MapperError, MapperResult};
pub use io::{Completion, IoRequest, IoSink, IoStats, IoStatsSnapshot, IoTracker, Submission};
pub use loader::{TargetSpec, load_table};
pub use mapper::DeviceMapper;
pub use registry::{DeviceRef, DeviceRegistry};
pub use table::{MappingTable, TableBuilder, TableDevices};
pub use target::{MapOutcome, Resolver, Target, TargetRegistry, TargetType, TargetTypeHandle};

pub use devmapper_common::{
    DeviceId, DeviceName, Direction, MapperConfig, Minor, SECTOR_SIZE, Sector, SuspendConfig,
};
