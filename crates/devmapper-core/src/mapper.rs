//! Top-level handle tying the registries and the dispatcher together

use crate::devices::DeviceProvider;
use crate::dispatch::IoDispatcher;
use crate::error::{IoError, MapperResult};
use crate::io::{IoRequest, IoSink, Submission};
use crate::loader::{TargetSpec, load_table};
use crate::registry::DeviceRegistry;
use crate::table::MappingTable;
use crate::target::TargetRegistry;
use devmapper_common::{MapperConfig, Minor};

use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// A device mapper instance
///
/// Derefs to its `DeviceRegistry` for the management operations.
#[derive(Debug)]
pub struct DeviceMapper {
    config: MapperConfig,
    targets: TargetRegistry,
    devices: Arc<DeviceRegistry>,
    dispatcher: IoDispatcher,
}

impl DeviceMapper {
    /// Create an instance with the built-in target types
    pub fn new(
        config: MapperConfig,
        provider: Arc<dyn DeviceProvider>,
        sink: Arc<dyn IoSink>,
    ) -> MapperResult<Self> {
        Self::with_targets(config, TargetRegistry::with_builtins(), provider, sink)
    }

    /// Create an instance with a caller-supplied target registry
    pub fn with_targets(
        config: MapperConfig,
        targets: TargetRegistry,
        provider: Arc<dyn DeviceProvider>,
        sink: Arc<dyn IoSink>,
    ) -> MapperResult<Self> {
        config.validate()?;

        let devices = Arc::new(DeviceRegistry::new(&config, provider, sink));
        let dispatcher = IoDispatcher::new(Arc::clone(&devices));
        debug!(
            "Device mapper ready: {} minors, fan-out {}, target types {:?}",
            config.max_devices,
            config.keys_per_node,
            targets.names()
        );

        Ok(Self {
            config,
            targets,
            devices,
            dispatcher,
        })
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn dispatcher(&self) -> &IoDispatcher {
        &self.dispatcher
    }

    /// Build a table with the configured fan-out
    pub fn load_table(&self, specs: &[TargetSpec]) -> MapperResult<MappingTable> {
        load_table(&self.targets, self.config.keys_per_node, specs)
    }

    /// Submit a request to a mapped device
    pub fn submit(&self, minor: Minor, request: IoRequest) -> Result<Submission, IoError> {
        self.dispatcher.submit(minor, request)
    }
}

impl Deref for DeviceMapper {
    type Target = DeviceRegistry;

    fn deref(&self) -> &DeviceRegistry {
        &self.devices
    }
}
