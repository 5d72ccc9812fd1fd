//! Underlying device access
//!
//! Several mapped devices may sit on the same real device. The
//! `OpenDeviceTable` counts openers by identity so the provider sees a
//! single open and a single close per device.

use crate::error::{MapperError, MapperResult};
use devmapper_common::DeviceId;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Opens and closes real devices
pub trait DeviceProvider: Send + Sync {
    /// Open `device` for I/O
    fn open(&self, device: &DeviceId) -> Result<(), String>;

    /// Release a device previously opened
    fn close(&self, device: &DeviceId);
}

/// Provider for which every open succeeds
#[derive(Debug, Default)]
pub struct NullDeviceProvider;

impl DeviceProvider for NullDeviceProvider {
    fn open(&self, _device: &DeviceId) -> Result<(), String> {
        Ok(())
    }

    fn close(&self, _device: &DeviceId) {}
}

/// Shared open counts per underlying device
pub struct OpenDeviceTable {
    provider: Arc<dyn DeviceProvider>,
    counts: Mutex<HashMap<DeviceId, usize>>,
}

impl OpenDeviceTable {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Open every device in order.
    ///
    /// On the first failure the devices already opened by this call are
    /// released again, in reverse order, and nothing stays held.
    pub fn acquire_all<'a>(
        &self,
        devices: impl IntoIterator<Item = &'a DeviceId>,
    ) -> MapperResult<Vec<DeviceId>> {
        let mut opened = Vec::new();

        for device in devices {
            if let Err(cause) = self.acquire(device) {
                warn!(
                    "Failed to open {}: {}; releasing {} devices",
                    device,
                    cause,
                    opened.len()
                );
                self.release_all(opened.drain(..).rev());
                return Err(MapperError::DeviceOpenFailed {
                    device: device.clone(),
                    cause,
                });
            }
            opened.push(device.clone());
        }

        Ok(opened)
    }

    /// Release devices taken with `acquire_all`
    pub fn release_all(&self, devices: impl IntoIterator<Item = DeviceId>) {
        for device in devices {
            self.release(&device);
        }
    }

    /// Open one device, calling the provider only for the first opener
    pub fn acquire(&self, device: &DeviceId) -> Result<(), String> {
        let mut counts = self.counts.lock();

        if let Some(count) = counts.get_mut(device) {
            *count += 1;
            return Ok(());
        }

        self.provider.open(device)?;
        counts.insert(device.clone(), 1);
        debug!("Opened underlying device {}", device);
        Ok(())
    }

    /// Drop one opener, closing the device with the last one
    pub fn release(&self, device: &DeviceId) {
        let mut counts = self.counts.lock();

        let Some(count) = counts.get_mut(device) else {
            panic!("released device {device} which is not open");
        };

        *count -= 1;
        if *count == 0 {
            counts.remove(device);
            self.provider.close(device);
            debug!("Closed underlying device {}", device);
        }
    }

    /// Openers of `device`
    pub fn open_count(&self, device: &DeviceId) -> usize {
        self.counts.lock().get(device).copied().unwrap_or(0)
    }

    /// Number of distinct devices currently open
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }
}

impl std::fmt::Debug for OpenDeviceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDeviceTable")
            .field("open", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Provider that records calls and fails opens of chosen devices
    #[derive(Default)]
    pub(crate) struct RecordingProvider {
        pub(crate) log: Mutex<Vec<String>>,
        pub(crate) failing: Mutex<Vec<DeviceId>>,
    }

    impl RecordingProvider {
        pub(crate) fn fail_on(&self, device: &str) {
            self.failing.lock().push(DeviceId::from(device));
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl DeviceProvider for RecordingProvider {
        fn open(&self, device: &DeviceId) -> Result<(), String> {
            if self.failing.lock().contains(device) {
                self.log.lock().push(format!("open-failed {device}"));
                return Err("no such device".to_string());
            }
            self.log.lock().push(format!("open {device}"));
            Ok(())
        }

        fn close(&self, device: &DeviceId) {
            self.log.lock().push(format!("close {device}"));
        }
    }

    fn ids(names: &[&str]) -> Vec<DeviceId> {
        names.iter().map(|n| DeviceId::from(*n)).collect()
    }

    #[test]
    fn test_shared_device_opened_once() {
        let provider = Arc::new(RecordingProvider::default());
        let table = OpenDeviceTable::new(provider.clone());
        let sda = DeviceId::from("/dev/sda");

        table.acquire(&sda).unwrap();
        table.acquire(&sda).unwrap();
        assert_eq!(table.open_count(&sda), 2);

        table.release(&sda);
        assert_eq!(provider.calls(), vec!["open /dev/sda"]);

        table.release(&sda);
        assert_eq!(provider.calls(), vec!["open /dev/sda", "close /dev/sda"]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_third_of_five_failure_rolls_back_first_two() {
        let provider = Arc::new(RecordingProvider::default());
        provider.fail_on("/dev/c");
        let table = OpenDeviceTable::new(provider.clone());
        let devices = ids(&["/dev/a", "/dev/b", "/dev/c", "/dev/d", "/dev/e"]);

        let result = table.acquire_all(&devices);
        match result {
            Err(MapperError::DeviceOpenFailed { device, cause }) => {
                assert_eq!(device, DeviceId::from("/dev/c"));
                assert_eq!(cause, "no such device");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(
            provider.calls(),
            vec![
                "open /dev/a",
                "open /dev/b",
                "open-failed /dev/c",
                "close /dev/b",
                "close /dev/a",
            ]
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_rollback_keeps_other_openers() {
        let provider = Arc::new(RecordingProvider::default());
        provider.fail_on("/dev/b");
        let table = OpenDeviceTable::new(provider.clone());
        let sda = DeviceId::from("/dev/a");

        table.acquire(&sda).unwrap();
        assert!(table.acquire_all(&ids(&["/dev/a", "/dev/b"])).is_err());

        // the earlier opener still holds /dev/a
        assert_eq!(table.open_count(&sda), 1);
        assert!(!provider.calls().contains(&"close /dev/a".to_string()));
    }

    #[test]
    #[should_panic(expected = "not open")]
    fn test_release_unopened_panics() {
        let table = OpenDeviceTable::new(Arc::new(NullDeviceProvider));
        table.release(&DeviceId::from("/dev/a"));
    }
}
