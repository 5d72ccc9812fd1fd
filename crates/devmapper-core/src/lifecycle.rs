//! Activation, suspend and table replacement
//!
//! Every operation here first takes the device's control mutex, so at most
//! one management operation runs per device. The registry lock is taken
//! only for short state flips; draining in-flight I/O, opening underlying
//! devices and running target destructors all happen without it.

use crate::device::DeviceState;
use crate::error::{MapperError, MapperResult};
use crate::io::IoTracker;
use crate::registry::{DeviceRef, DeviceRegistry};
use crate::table::MappingTable;
use devmapper_common::{DeviceId, Minor};

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl DeviceRegistry {
    /// Bind `table` and start routing I/O.
    ///
    /// Opens every underlying device of the table first; if one fails the
    /// ones already opened are closed and the table is dropped. Any table
    /// bound before is dropped on success. Requests deferred while the
    /// device was inactive are replayed, in arrival order, before the
    /// device is marked active.
    pub fn activate(&self, id: impl Into<DeviceRef>, table: MappingTable) -> MapperResult<()> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        {
            let mut slots = self.slots.write();
            let device = self.checked(&mut slots, &id, &control)?;
            if device.state.is_active() {
                return Err(MapperError::AlreadyActive(device.name.to_string()));
            }
        }

        if table.is_empty() {
            return Err(MapperError::InvalidTable("table has no targets".to_string()));
        }

        let opened = self.open_devices.acquire_all(table.devices().iter())?;
        self.start(&id, &control, Some(table), opened)
    }

    /// Reactivate a suspended device with the table it has bound
    pub fn resume(&self, id: impl Into<DeviceRef>) -> MapperResult<()> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        let devices: Vec<DeviceId> = {
            let mut slots = self.slots.write();
            let device = self.checked(&mut slots, &id, &control)?;
            if device.state.is_active() {
                return Err(MapperError::AlreadyActive(device.name.to_string()));
            }
            let table = device
                .table
                .as_ref()
                .ok_or_else(|| MapperError::InvalidTable(format!("{} has no table", device.name)))?;
            table.devices().iter().cloned().collect()
        };

        let opened = self.open_devices.acquire_all(&devices)?;
        self.start(&id, &control, None, opened)
    }

    /// Stop routing I/O and wait for in-flight requests to complete.
    ///
    /// New requests are queued from the moment the device leaves the
    /// active state. Underlying devices are closed once the last request
    /// completes; the table stays bound. With a drain timeout configured
    /// and exceeded, the device is made active again and `DrainTimeout`
    /// is returned.
    pub fn suspend(&self, id: impl Into<DeviceRef>) -> MapperResult<()> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        let (minor, name, io) = {
            let mut slots = self.slots.write();
            let device = self.checked(&mut slots, &id, &control)?;
            if !device.state.is_active() {
                return Err(MapperError::AlreadyInactive(device.name.to_string()));
            }
            device.state = DeviceState::Suspended;
            (device.minor, device.name.to_string(), Arc::clone(&device.io))
        };

        self.drain(minor, &name, &io)?;

        let opened = {
            let mut slots = self.slots.write();
            let device = self.checked(&mut slots, &id, &control)?;
            std::mem::take(&mut device.open_devices)
        };
        self.open_devices.release_all(opened);

        info!("Suspended device {} (minor {})", name, minor);
        Ok(())
    }

    /// Replace the bound table of an inactive device.
    ///
    /// Returns the table bound before, if any. The new table goes live on
    /// the next `resume`.
    pub fn swap_table(
        &self,
        id: impl Into<DeviceRef>,
        table: MappingTable,
    ) -> MapperResult<Option<MappingTable>> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        if table.is_empty() {
            return Err(MapperError::InvalidTable("table has no targets".to_string()));
        }

        let mut slots = self.slots.write();
        let device = self.checked(&mut slots, &id, &control)?;
        if device.state.is_active() {
            return Err(MapperError::AlreadyActive(device.name.to_string()));
        }

        let name = device.name.to_string();
        let previous = device.table.replace(table);
        drop(slots);

        info!("Swapped table of device {}", name);
        Ok(previous)
    }

    /// Detach the bound table of an inactive device
    pub fn take_table(&self, id: impl Into<DeviceRef>) -> MapperResult<Option<MappingTable>> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        let mut slots = self.slots.write();
        let device = self.checked(&mut slots, &id, &control)?;
        if device.state.is_active() {
            return Err(MapperError::AlreadyActive(device.name.to_string()));
        }
        Ok(device.table.take())
    }

    /// Return a device to `Created`, draining it first if active.
    ///
    /// Closes its underlying devices, drops its table and fails every
    /// queued request.
    pub fn deactivate(&self, id: impl Into<DeviceRef>) -> MapperResult<()> {
        let id = id.into();
        let control = self.control(&id)?;
        let _guard = control.lock();

        let (minor, name, io, was_active) = {
            let mut slots = self.slots.write();
            let device = self.checked(&mut slots, &id, &control)?;
            if device.open_count > 0 {
                return Err(MapperError::DeviceInUse {
                    name: device.name.to_string(),
                    open_count: device.open_count,
                });
            }
            let was_active = device.state.is_active();
            if was_active {
                device.state = DeviceState::Suspended;
            }
            (
                device.minor,
                device.name.to_string(),
                Arc::clone(&device.io),
                was_active,
            )
        };

        if was_active {
            self.drain(minor, &name, &io)?;
        }

        let teardown = {
            let mut slots = self.slots.write();
            self.checked(&mut slots, &id, &control)?.teardown()
        };
        self.release(&name, teardown);

        info!("Deactivated device {} (minor {})", name, minor);
        Ok(())
    }

    /// Bind resources and replay deferred I/O; the final step of
    /// `activate` and `resume`
    fn start(
        &self,
        id: &DeviceRef,
        control: &Arc<Mutex<()>>,
        table: Option<MappingTable>,
        opened: Vec<DeviceId>,
    ) -> MapperResult<()> {
        let (minor, name, previous, stale) = {
            let mut slots = self.slots.write();
            let device = match self.checked(&mut slots, id, control) {
                Ok(device) => device,
                Err(e) => {
                    drop(slots);
                    self.open_devices.release_all(opened);
                    return Err(e);
                }
            };

            let previous = table.and_then(|table| device.table.replace(table));
            let stale = std::mem::replace(&mut device.open_devices, opened);
            (device.minor, device.name.to_string(), previous, stale)
        };

        self.open_devices.release_all(stale);
        drop(previous);

        self.replay_deferred(minor);
        info!("Activated device {} (minor {})", name, minor);
        Ok(())
    }

    /// Wait for in-flight I/O of a device that just left the active state.
    ///
    /// On timeout the device is reactivated before the error is returned.
    fn drain(&self, minor: Minor, name: &str, io: &IoTracker) -> MapperResult<()> {
        debug!("Draining {} requests on device {}", io.pending(), name);

        if io.wait_idle(self.drain_timeout) {
            return Ok(());
        }

        let pending = io.pending();
        warn!(
            "Device {} still has {} requests in flight after {:?}; reactivating",
            name, pending, self.drain_timeout
        );
        self.replay_deferred(minor);
        Err(MapperError::DrainTimeout {
            name: name.to_string(),
            pending,
        })
    }
}
