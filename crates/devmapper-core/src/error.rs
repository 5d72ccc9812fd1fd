//! Device mapper error types

use devmapper_common::{ConfigError, DeviceId, DeviceNameError, Minor, Sector};
use thiserror::Error;

/// Management and table construction errors
#[derive(Error, Debug)]
pub enum MapperError {
    /// A target does not start where the previous one ended
    #[error("Gap in target ranges: expected start {expected}, got {found}")]
    GapInRanges { expected: Sector, found: Sector },

    /// A target begins inside a range that is already mapped
    #[error("Target {index} at sector {start} overlaps the range ending at {previous_high}")]
    OverlappingRanges {
        index: usize,
        start: Sector,
        previous_high: Sector,
    },

    /// Target line is malformed (e.g. zero length)
    #[error("Invalid target at sector {start}: {reason}")]
    InvalidTarget { start: Sector, reason: String },

    /// No target type registered under this name
    #[error("Unknown target type: {0}")]
    UnknownTargetType(String),

    /// Target constructor rejected its arguments
    #[error("Target constructor failed ({target}): {message}")]
    TargetConstructorFailed { target: String, message: String },

    /// Table completed with no targets
    #[error("Table has no targets")]
    EmptyTable,

    /// Name or minor already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Resource still referenced
    #[error("Busy: {0}")]
    Busy(String),

    /// Mapped device not found
    #[error("No such device: {0}")]
    NoSuchDevice(String),

    /// Every minor below the capacity is in use
    #[error("No free minor numbers")]
    NoFreeMinor,

    /// Requested minor is beyond the configured capacity
    #[error("Minor {minor} out of range (max_devices = {max})")]
    InvalidMinor { minor: Minor, max: u32 },

    /// Device name failed validation
    #[error("Invalid device name: {0}")]
    InvalidName(#[from] DeviceNameError),

    /// Table cannot be bound
    #[error("Invalid table: {0}")]
    InvalidTable(String),

    /// Operation requires an inactive device
    #[error("Device {0} is already active")]
    AlreadyActive(String),

    /// Suspend or deactivate of a device that is not running
    #[error("Device {0} is not active")]
    AlreadyInactive(String),

    /// Open of a device that is not active
    #[error("Device {0} is not active")]
    NotActive(String),

    /// Device still has external openers
    #[error("Device {name} is in use ({open_count} openers)")]
    DeviceInUse { name: String, open_count: u32 },

    /// Close without a matching open
    #[error("Device {0} is not open")]
    NotOpen(String),

    /// An underlying device could not be opened
    #[error("Failed to open device {device}: {cause}")]
    DeviceOpenFailed { device: DeviceId, cause: String },

    /// In-flight I/O did not drain within the configured timeout
    #[error("Device {name} still has {pending} requests in flight")]
    DrainTimeout { name: String, pending: usize },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for management operations
pub type MapperResult<T> = Result<T, MapperError>;

/// Completion status of a failed request
///
/// Returned from `submit` and delivered to the request's completion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// No mapped device with this minor
    #[error("No such device: minor {0}")]
    NoSuchDevice(Minor),

    /// The target refused the request
    #[error("Target rejected request: {0}")]
    TargetRejected(String),

    /// Request addressed past the end of the table
    #[error("Sector {sector} is beyond the end of the device ({size} sectors)")]
    SectorOutOfRange { sector: Sector, size: Sector },

    /// Device went away while the request was deferred
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Error reported by the lower layer
    #[error("Lower device error: {0}")]
    Lower(String),
}

/// Completion status of a request
pub type IoStatus = Result<(), IoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MapperError::NoSuchDevice("vol0".to_string());
        assert_eq!(err.to_string(), "No such device: vol0");

        let err = MapperError::TargetConstructorFailed {
            target: "linear".to_string(),
            message: "missing device".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Target constructor failed (linear): missing device"
        );

        let err = IoError::SectorOutOfRange {
            sector: 200,
            size: 100,
        };
        assert_eq!(
            err.to_string(),
            "Sector 200 is beyond the end of the device (100 sectors)"
        );
    }
}
