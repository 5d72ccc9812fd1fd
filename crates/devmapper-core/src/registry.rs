//! Device registry
//!
//! All mapped devices live in one map behind a single reader/writer lock.
//! The I/O path only ever takes it shared; management operations take it
//! exclusively and only for as long as it takes to flip state or move a
//! table. Nothing blocks while holding it.
//!
//! Lock order: per-device control mutex, then the registry lock, then the
//! open-device table. Provider calls and completions run with the registry
//! lock released.

use crate::device::{DeviceInfo, MappedDevice, Teardown};
use crate::devices::{DeviceProvider, OpenDeviceTable};
use crate::error::{IoError, MapperError, MapperResult};
use crate::io::IoSink;
use crate::table::MappingTable;
use devmapper_common::{DeviceName, MapperConfig, Minor};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reference to a mapped device by name or minor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceRef {
    Name(String),
    Minor(Minor),
}

impl From<&str> for DeviceRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for DeviceRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&DeviceName> for DeviceRef {
    fn from(name: &DeviceName) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<Minor> for DeviceRef {
    fn from(minor: Minor) -> Self {
        Self::Minor(minor)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Minor(minor) => write!(f, "minor {minor}"),
        }
    }
}

/// Devices by minor, plus the name index
#[derive(Default)]
pub(crate) struct Slots {
    pub(crate) devices: BTreeMap<Minor, MappedDevice>,
    pub(crate) names: HashMap<String, Minor>,
}

impl Slots {
    pub(crate) fn resolve(&self, id: &DeviceRef) -> Option<Minor> {
        match id {
            DeviceRef::Name(name) => self.names.get(name).copied(),
            DeviceRef::Minor(minor) => self.devices.contains_key(minor).then_some(*minor),
        }
    }

    pub(crate) fn get(&self, id: &DeviceRef) -> MapperResult<&MappedDevice> {
        self.resolve(id)
            .and_then(|minor| self.devices.get(&minor))
            .ok_or_else(|| MapperError::NoSuchDevice(id.to_string()))
    }

    pub(crate) fn get_mut(&mut self, id: &DeviceRef) -> MapperResult<&mut MappedDevice> {
        let minor = self.resolve(id);
        minor
            .and_then(|minor| self.devices.get_mut(&minor))
            .ok_or_else(|| MapperError::NoSuchDevice(id.to_string()))
    }

    /// Lowest minor below `max` not in use
    fn free_minor(&self, max: u32) -> Option<Minor> {
        let mut candidate = 0;
        for &minor in self.devices.keys() {
            if minor != candidate {
                break;
            }
            candidate += 1;
        }
        (candidate < max).then_some(candidate)
    }
}

/// Registry of mapped devices
pub struct DeviceRegistry {
    pub(crate) slots: RwLock<Slots>,
    pub(crate) open_devices: OpenDeviceTable,
    pub(crate) sink: Arc<dyn IoSink>,
    max_devices: u32,
    pub(crate) drain_timeout: Option<Duration>,
}

impl DeviceRegistry {
    pub fn new(
        config: &MapperConfig,
        provider: Arc<dyn DeviceProvider>,
        sink: Arc<dyn IoSink>,
    ) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            open_devices: OpenDeviceTable::new(provider),
            sink,
            max_devices: config.max_devices,
            drain_timeout: config.suspend.drain_timeout(),
        }
    }

    /// Create a mapped device in the `Created` state.
    ///
    /// Without an explicit minor the lowest free one is allocated.
    pub fn create(&self, name: &str, minor: Option<Minor>) -> MapperResult<Minor> {
        let name = DeviceName::new(name)?;
        let mut slots = self.slots.write();

        if slots.names.contains_key(name.as_str()) {
            return Err(MapperError::AlreadyExists(format!("device {name}")));
        }

        let minor = match minor {
            Some(minor) if minor >= self.max_devices => {
                return Err(MapperError::InvalidMinor {
                    minor,
                    max: self.max_devices,
                });
            }
            Some(minor) if slots.devices.contains_key(&minor) => {
                return Err(MapperError::AlreadyExists(format!("minor {minor}")));
            }
            Some(minor) => minor,
            None => slots
                .free_minor(self.max_devices)
                .ok_or(MapperError::NoFreeMinor)?,
        };

        slots.names.insert(name.to_string(), minor);
        slots
            .devices
            .insert(minor, MappedDevice::new(name.clone(), minor));
        drop(slots);

        info!("Created device {} (minor {})", name, minor);
        Ok(minor)
    }

    /// Remove an inactive device with no openers.
    ///
    /// Requests still queued on it are failed.
    pub fn remove(&self, id: impl Into<DeviceRef>) -> MapperResult<()> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        let mut slots = self.slots.write();
        let device = self.checked(&mut slots, &id, &control)?;

        if device.open_count > 0 {
            return Err(MapperError::DeviceInUse {
                name: device.name.to_string(),
                open_count: device.open_count,
            });
        }
        if device.state.is_active() {
            return Err(MapperError::AlreadyActive(device.name.to_string()));
        }

        let minor = device.minor;
        let name = device.name.to_string();
        let teardown = device.teardown();
        slots.names.remove(&name);
        slots.devices.remove(&minor);
        drop(slots);

        self.release(&name, teardown);
        info!("Removed device {} (minor {})", name, minor);
        Ok(())
    }

    /// Register an external opener of an active device
    pub fn open(&self, id: impl Into<DeviceRef>) -> MapperResult<u32> {
        let id = id.into();
        let mut slots = self.slots.write();
        let device = slots.get_mut(&id)?;

        if !device.state.is_active() {
            return Err(MapperError::NotActive(device.name.to_string()));
        }
        device.open_count += 1;
        Ok(device.open_count)
    }

    /// Drop an external opener
    pub fn close(&self, id: impl Into<DeviceRef>) -> MapperResult<u32> {
        let id = id.into();
        let mut slots = self.slots.write();
        let device = slots.get_mut(&id)?;

        if device.open_count == 0 {
            return Err(MapperError::NotOpen(device.name.to_string()));
        }
        device.open_count -= 1;
        Ok(device.open_count)
    }

    /// Snapshot of one device
    pub fn info(&self, id: impl Into<DeviceRef>) -> Option<DeviceInfo> {
        let slots = self.slots.read();
        slots.get(&id.into()).ok().map(MappedDevice::info)
    }

    /// Snapshots of every device, by ascending minor
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.slots
            .read()
            .devices
            .values()
            .map(MappedDevice::info)
            .collect()
    }

    /// Status lines of the bound table; empty without one
    pub fn table_status(&self, id: impl Into<DeviceRef>) -> MapperResult<Vec<String>> {
        let slots = self.slots.read();
        let device = slots.get(&id.into())?;
        Ok(device
            .table
            .as_ref()
            .map(MappingTable::status_lines)
            .unwrap_or_default())
    }

    /// Minor of a device
    pub fn minor(&self, id: impl Into<DeviceRef>) -> MapperResult<Minor> {
        let id = id.into();
        self.slots
            .read()
            .resolve(&id)
            .ok_or_else(|| MapperError::NoSuchDevice(id.to_string()))
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.slots.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().devices.is_empty()
    }

    pub fn max_devices(&self) -> u32 {
        self.max_devices
    }

    /// Management mutex of a device
    pub(crate) fn control(&self, id: &DeviceRef) -> MapperResult<Arc<Mutex<()>>> {
        let slots = self.slots.read();
        Ok(Arc::clone(&slots.get(id)?.control))
    }

    /// Look a device up again after taking its control mutex.
    ///
    /// The device may have been removed (and its minor reused) while the
    /// caller waited for the mutex.
    pub(crate) fn checked<'a>(
        &self,
        slots: &'a mut Slots,
        id: &DeviceRef,
        control: &Arc<Mutex<()>>,
    ) -> MapperResult<&'a mut MappedDevice> {
        let device = slots.get_mut(id)?;
        if !Arc::ptr_eq(&device.control, control) {
            return Err(MapperError::NoSuchDevice(id.to_string()));
        }
        Ok(device)
    }

    /// Release resources detached from a device, outside the registry lock
    pub(crate) fn release(&self, name: &str, teardown: Teardown) {
        let Teardown {
            table,
            open_devices,
            deferred,
        } = teardown;

        self.open_devices.release_all(open_devices);
        drop(table);

        for request in deferred {
            request.complete(Err(IoError::DeviceUnavailable(name.to_string())));
        }
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .field("max_devices", &self.max_devices)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::NullDeviceProvider;
    use crate::io::IoRequest;

    struct DropSink;

    impl IoSink for DropSink {
        fn submit(&self, request: IoRequest) {
            request.complete(Ok(()));
        }
    }

    fn registry(max_devices: u32) -> DeviceRegistry {
        let config = MapperConfig {
            max_devices,
            ..MapperConfig::default()
        };
        DeviceRegistry::new(&config, Arc::new(NullDeviceProvider), Arc::new(DropSink))
    }

    #[test]
    fn test_create_allocates_lowest_free_minor() {
        let registry = registry(8);
        assert_eq!(registry.create("a", None).unwrap(), 0);
        assert_eq!(registry.create("b", Some(2)).unwrap(), 2);
        assert_eq!(registry.create("c", None).unwrap(), 1);
        assert_eq!(registry.create("d", None).unwrap(), 3);

        registry.remove("a").unwrap();
        assert_eq!(registry.create("e", None).unwrap(), 0);
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_minors() {
        let registry = registry(2);
        registry.create("vol0", Some(1)).unwrap();

        assert!(matches!(
            registry.create("vol0", None),
            Err(MapperError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.create("vol1", Some(1)),
            Err(MapperError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.create("vol1", Some(2)),
            Err(MapperError::InvalidMinor { minor: 2, max: 2 })
        ));
        assert!(matches!(
            registry.create("a/b", None),
            Err(MapperError::InvalidName(_))
        ));

        registry.create("vol1", None).unwrap();
        assert!(matches!(
            registry.create("vol2", None),
            Err(MapperError::NoFreeMinor)
        ));
    }

    #[test]
    fn test_lookup_by_name_and_minor() {
        let registry = registry(8);
        registry.create("vol0", Some(5)).unwrap();

        assert_eq!(registry.minor("vol0").unwrap(), 5);
        assert_eq!(registry.info(5).unwrap().name, "vol0");
        assert!(registry.info("missing").is_none());
        assert!(matches!(
            registry.minor(4),
            Err(MapperError::NoSuchDevice(_))
        ));
    }

    #[test]
    fn test_open_requires_active_device() {
        let registry = registry(8);
        registry.create("vol0", None).unwrap();

        assert!(matches!(
            registry.open("vol0"),
            Err(MapperError::NotActive(_))
        ));
        assert!(matches!(
            registry.close("vol0"),
            Err(MapperError::NotOpen(_))
        ));
    }

    #[test]
    fn test_remove_unknown_device() {
        let registry = registry(8);
        assert!(matches!(
            registry.remove("vol0"),
            Err(MapperError::NoSuchDevice(_))
        ));
    }

    #[test]
    fn test_remove_fails_queued_requests() {
        let registry = registry(8);
        registry.create("vol0", None).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        registry
            .slots
            .write()
            .get_mut(&DeviceRef::from("vol0"))
            .unwrap()
            .deferred
            .get_mut()
            .push_back(IoRequest::read(0, 1).on_complete(move |status| tx.send(status).unwrap()));

        registry.remove("vol0").unwrap();

        assert_eq!(
            rx.recv().unwrap(),
            Err(IoError::DeviceUnavailable("vol0".to_string()))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_sorted_by_minor() {
        let registry = registry(8);
        registry.create("b", Some(4)).unwrap();
        registry.create("a", Some(1)).unwrap();

        let minors: Vec<_> = registry.list().iter().map(|info| info.minor).collect();
        assert_eq!(minors, vec![1, 4]);
        assert!(registry.table_status("a").unwrap().is_empty());
    }
}
