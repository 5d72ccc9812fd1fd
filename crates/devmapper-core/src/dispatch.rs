//! I/O dispatch
//!
//! The hot path takes the registry lock shared, finds the target covering
//! the request's first sector and lets it map the request. Requests for a
//! device that is not active are queued on the device under the exclusive
//! lock; the state is re-checked there because it may have changed while
//! no lock was held.
//!
//! Remapped requests are counted as in flight before the lower layer can
//! see them, and their completion is wrapped so the count drops after the
//! submitter has been told. Completions and lower-layer submission always
//! run with the registry lock released.

use crate::device::DeviceState;
use crate::error::{IoError, IoStatus};
use crate::io::{IoRequest, IoSink, Submission};
use crate::registry::{DeviceRegistry, Slots};
use crate::target::MapOutcome;
use devmapper_common::Minor;

use parking_lot::RwLockWriteGuard;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// What to do with a request once the registry lock is released
enum Routed {
    /// Hand to the lower layer
    Forward(IoRequest),
    /// Finish here with this status
    Complete(IoRequest, IoStatus),
}

/// Map a request through the bound table of `minor`
fn route(slots: &Slots, minor: Minor, mut request: IoRequest) -> Routed {
    let Some(device) = slots.devices.get(&minor) else {
        return Routed::Complete(request, Err(IoError::NoSuchDevice(minor)));
    };
    let stats = device.io.stats();

    let fail = |request, error| {
        stats.record_error();
        Routed::Complete(request, Err(error))
    };

    let Some(table) = device.table.as_ref() else {
        return fail(request, IoError::DeviceUnavailable(device.name.to_string()));
    };

    let sector = request.sector;
    let Some((index, target)) = table
        .lookup(sector)
        .and_then(|index| Some((index, table.target(index)?)))
    else {
        return fail(
            request,
            IoError::SectorOutOfRange {
                sector,
                size: table.size(),
            },
        );
    };

    match target.map(&mut request) {
        MapOutcome::Consumed => {
            stats.record_dispatch(request.direction, request.sectors);
            trace!("minor {} sector {}: consumed by target {}", minor, sector, index);
            Routed::Complete(request, Ok(()))
        }
        MapOutcome::Remapped => {
            stats.record_dispatch(request.direction, request.sectors);
            device.io.begin_io();
            request.track(Arc::clone(&device.io));
            trace!(
                "minor {} sector {}: target {} -> {:?} sector {}",
                minor, sector, index, request.device, request.sector
            );
            Routed::Forward(request)
        }
        MapOutcome::Rejected(reason) => {
            trace!("minor {} sector {}: rejected by target {}", minor, sector, index);
            fail(request, IoError::TargetRejected(reason))
        }
    }
}

/// Submit or complete a routed request
fn deliver(sink: &dyn IoSink, routed: Routed) -> Result<Submission, IoError> {
    match routed {
        Routed::Forward(request) => {
            sink.submit(request);
            Ok(Submission::Dispatched)
        }
        Routed::Complete(request, Ok(())) => {
            request.complete(Ok(()));
            Ok(Submission::Dispatched)
        }
        Routed::Complete(request, Err(error)) => Err(request.fail(error)),
    }
}

impl DeviceRegistry {
    /// Route queued requests and mark the device active.
    ///
    /// Requests arriving while a batch is routed are queued behind it, so
    /// the device only turns active once the queue is seen empty under the
    /// exclusive lock. Nothing submitted after the call can overtake a
    /// request deferred before it.
    pub(crate) fn replay_deferred(&self, minor: Minor) {
        loop {
            let batch = {
                let mut slots = self.slots.write();
                let Some(device) = slots.devices.get_mut(&minor) else {
                    return;
                };
                let queue = device.deferred.get_mut();
                if queue.is_empty() {
                    device.state = DeviceState::Active;
                    return;
                }
                std::mem::take(queue)
            };

            debug!("Replaying {} deferred requests on minor {}", batch.len(), minor);

            let routed: Vec<Routed> = {
                let slots = self.slots.read();
                if let Some(device) = slots.devices.get(&minor) {
                    device.io.stats().record_replayed(batch.len());
                }
                batch
                    .into_iter()
                    .map(|request| route(&slots, minor, request))
                    .collect()
            };

            for routed in routed {
                // errors already reached the request's completion
                let _ = deliver(self.sink.as_ref(), routed);
            }
        }
    }
}

/// Entry point for block I/O on mapped devices
pub struct IoDispatcher {
    registry: Arc<DeviceRegistry>,
}

impl IoDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Submit a request to the device with the given minor.
    ///
    /// The request's completion fires exactly once: from the lower layer,
    /// here on error or consumption, or later for a deferred request when
    /// it is replayed or its device goes away. Errors are also returned.
    pub fn submit(&self, minor: Minor, request: IoRequest) -> Result<Submission, IoError> {
        let slots = self.registry.slots.read();
        let routable = slots
            .devices
            .get(&minor)
            .is_none_or(|device| device.state.is_active());

        if routable {
            let routed = route(&slots, minor, request);
            drop(slots);
            return deliver(self.registry.sink.as_ref(), routed);
        }
        drop(slots);

        self.defer_or_route(minor, request)
    }

    /// Slow path: queue the request unless the device became active (or
    /// went away) after the shared lock was dropped.
    fn defer_or_route(&self, minor: Minor, request: IoRequest) -> Result<Submission, IoError> {
        let mut slots = self.registry.slots.write();
        if let Some(device) = slots.devices.get_mut(&minor)
            && !device.state.is_active()
        {
            let queue = device.deferred.get_mut();
            trace!(
                "minor {} sector {}: deferred ({} queued)",
                minor,
                request.sector,
                queue.len() + 1
            );
            queue.push_back(request);
            device.io.stats().record_deferred();
            return Ok(Submission::Deferred);
        }

        // activated (or removed) while no lock was held
        let slots = RwLockWriteGuard::downgrade(slots);
        let routed = route(&slots, minor, request);
        drop(slots);
        deliver(self.registry.sink.as_ref(), routed)
    }
}

impl fmt::Debug for IoDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoDispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::NullDeviceProvider;
    use crate::loader::{TargetSpec, load_table};
    use crate::target::TargetRegistry;
    use devmapper_common::{DeviceId, MapperConfig, Sector};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(Option<DeviceId>, Sector)>>,
    }

    impl IoSink for RecordingSink {
        fn submit(&self, request: IoRequest) {
            self.seen.lock().push((request.device.clone(), request.sector));
            request.complete(Ok(()));
        }
    }

    /// Dispatcher with one suspended device `vol0` mapped linearly onto devA at 100
    fn suspended_device(sink: Arc<RecordingSink>) -> (IoDispatcher, Minor) {
        let registry = Arc::new(DeviceRegistry::new(
            &MapperConfig::default(),
            Arc::new(NullDeviceProvider),
            sink,
        ));
        let minor = registry.create("vol0", None).unwrap();
        let table = load_table(
            &TargetRegistry::with_builtins(),
            8,
            &[TargetSpec::new(0, 64, "linear", ["devA", "100"])],
        )
        .unwrap();
        registry.activate(minor, table).unwrap();
        registry.suspend(minor).unwrap();
        (IoDispatcher::new(registry), minor)
    }

    fn set_state(dispatcher: &IoDispatcher, minor: Minor, state: DeviceState) {
        let mut slots = dispatcher.registry().slots.write();
        slots.devices.get_mut(&minor).unwrap().state = state;
    }

    #[test]
    fn test_recheck_routes_when_activated_between_locks() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, minor) = suspended_device(sink.clone());

        // the shared-lock check saw a suspended device; activation lands
        // before the exclusive lock is taken
        set_state(&dispatcher, minor, DeviceState::Active);

        assert_eq!(
            dispatcher.defer_or_route(minor, IoRequest::read(5, 1)),
            Ok(Submission::Dispatched)
        );
        assert_eq!(*sink.seen.lock(), vec![(Some(DeviceId::from("devA")), 105)]);

        let info = dispatcher.registry().info(minor).unwrap();
        assert_eq!(info.deferred, 0);
        assert_eq!(info.pending, 0);
        assert_eq!(info.stats.deferred_ops, 0);
    }

    #[test]
    fn test_recheck_defers_while_still_inactive() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, minor) = suspended_device(sink.clone());

        assert_eq!(
            dispatcher.defer_or_route(minor, IoRequest::read(5, 1)),
            Ok(Submission::Deferred)
        );
        assert!(sink.seen.lock().is_empty());
        assert_eq!(dispatcher.registry().info(minor).unwrap().deferred, 1);
    }

    #[test]
    fn test_recheck_fails_request_for_removed_device() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, minor) = suspended_device(sink.clone());
        dispatcher.registry().deactivate(minor).unwrap();
        dispatcher.registry().remove(minor).unwrap();

        assert_eq!(
            dispatcher.defer_or_route(minor, IoRequest::read(5, 1)),
            Err(IoError::NoSuchDevice(minor))
        );
        assert!(sink.seen.lock().is_empty());
    }
}
