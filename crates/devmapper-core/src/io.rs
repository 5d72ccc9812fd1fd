//! I/O requests, completions and in-flight accounting
//!
//! A request carries its own completion callback. Whatever happens to it
//! (dispatch, deferral, rejection) the callback fires exactly once.

use crate::error::{IoError, IoStatus};
use devmapper_common::{DeviceId, Direction, Sector};

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Completion callback invoked with the final status of a request
pub type Completion = Box<dyn FnOnce(IoStatus) + Send + 'static>;

/// A block I/O request
///
/// `sector` is relative to the device the request currently addresses:
/// the mapped device on submission, the underlying device once a target
/// has remapped it (`device` is then set).
pub struct IoRequest {
    /// Caller-chosen tag, carried through untouched
    pub tag: u64,
    /// Read or write
    pub direction: Direction,
    /// First sector
    pub sector: Sector,
    /// Length in sectors
    pub sectors: u32,
    /// Underlying device, set by a remapping target
    pub device: Option<DeviceId>,
    completion: Option<Completion>,
}

impl IoRequest {
    /// Create a request without a completion callback
    pub fn new(direction: Direction, sector: Sector, sectors: u32) -> Self {
        Self {
            tag: 0,
            direction,
            sector,
            sectors,
            device: None,
            completion: None,
        }
    }

    /// Shorthand for a read request
    pub fn read(sector: Sector, sectors: u32) -> Self {
        Self::new(Direction::Read, sector, sectors)
    }

    /// Shorthand for a write request
    pub fn write(sector: Sector, sectors: u32) -> Self {
        Self::new(Direction::Write, sector, sectors)
    }

    /// Set the caller tag
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Set the completion callback
    pub fn on_complete(mut self, completion: impl FnOnce(IoStatus) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    /// Point the request at an underlying device
    pub fn remap(&mut self, device: DeviceId, sector: Sector) {
        self.device = Some(device);
        self.sector = sector;
    }

    /// Deliver the final status to the submitter
    pub fn complete(mut self, status: IoStatus) {
        if let Some(done) = self.completion.take() {
            done(status);
        }
    }

    /// Fail the request, returning the error for the caller's convenience
    pub(crate) fn fail(self, error: IoError) -> IoError {
        self.complete(Err(error.clone()));
        error
    }

    /// Wrap the completion so the tracker sees the request finish.
    ///
    /// Must be paired with a prior `IoTracker::begin_io`.
    pub(crate) fn track(&mut self, tracker: Arc<IoTracker>) {
        let original = self.completion.take();
        self.completion = Some(Box::new(move |status| {
            if status.is_err() {
                tracker.stats.record_error();
            }
            if let Some(done) = original {
                done(status);
            }
            tracker.end_io();
        }));
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("tag", &self.tag)
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// The layer below the mapper
///
/// Receives remapped requests. Implementations must eventually call
/// `IoRequest::complete` exactly once per request; a request that is never
/// completed blocks `suspend` forever.
pub trait IoSink: Send + Sync {
    fn submit(&self, request: IoRequest);
}

/// What happened to a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Routed through the table
    Dispatched,
    /// Queued until the device is resumed
    Deferred,
}

/// Per-device I/O counters
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    read_sectors: AtomicU64,
    write_sectors: AtomicU64,
    deferred_ops: AtomicU64,
    replayed_ops: AtomicU64,
    error_ops: AtomicU64,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request routed through the table
    pub fn record_dispatch(&self, direction: Direction, sectors: u32) {
        let (ops, total) = match direction {
            Direction::Read => (&self.read_ops, &self.read_sectors),
            Direction::Write => (&self.write_ops, &self.write_sectors),
        };
        ops.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(u64::from(sectors), Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self, count: usize) {
        self.replayed_ops.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_sectors: self.read_sectors.load(Ordering::Relaxed),
            write_sectors: self.write_sectors.load(Ordering::Relaxed),
            deferred_ops: self.deferred_ops.load(Ordering::Relaxed),
            replayed_ops: self.replayed_ops.load(Ordering::Relaxed),
            error_ops: self.error_ops.load(Ordering::Relaxed),
        }
    }
}

/// Copy of `IoStats` at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_sectors: u64,
    pub write_sectors: u64,
    pub deferred_ops: u64,
    pub replayed_ops: u64,
    pub error_ops: u64,
}

/// In-flight request accounting for one mapped device
///
/// `pending` counts requests handed to the lower layer and not yet
/// completed. Suspend waits on `idle` until it reaches zero.
#[derive(Debug, Default)]
pub struct IoTracker {
    pending: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    pub(crate) stats: IoStats,
}

impl IoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests currently in flight
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Counters for this device
    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// Account for a request about to be handed to the lower layer
    pub(crate) fn begin_io(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Account for a completed request and wake drain waiters at zero
    pub(crate) fn end_io(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "I/O completion without a matching dispatch");

        if previous == 1 {
            // Taking the lock orders this wake-up after a waiter's check
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    /// Block until no requests are in flight.
    ///
    /// With a timeout, returns `false` if requests were still outstanding
    /// when it expired.
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.idle_lock.lock();

        while self.pending() > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut guard, deadline).timed_out() {
                        return self.pending() == 0;
                    }
                }
                None => self.idle.wait(&mut guard),
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_completion_fires_once_with_status() {
        let (tx, rx) = mpsc::channel();
        let request = IoRequest::read(10, 8)
            .with_tag(7)
            .on_complete(move |status| tx.send(status).unwrap());

        request.complete(Err(IoError::Lower("media error".into())));

        assert_eq!(rx.recv().unwrap(), Err(IoError::Lower("media error".into())));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remap_sets_device_and_sector() {
        let mut request = IoRequest::write(100, 1);
        request.remap(DeviceId::from("/dev/sdb"), 600);

        assert_eq!(request.device, Some(DeviceId::from("/dev/sdb")));
        assert_eq!(request.sector, 600);
        assert_eq!(request.direction, Direction::Write);
    }

    #[test]
    fn test_tracked_completion_decrements_after_callback() {
        let tracker = Arc::new(IoTracker::new());
        let seen = Arc::new(AtomicUsize::new(usize::MAX));

        let mut request = {
            let tracker = Arc::clone(&tracker);
            let seen = Arc::clone(&seen);
            IoRequest::read(0, 1).on_complete(move |_| {
                seen.store(tracker.pending(), Ordering::SeqCst);
            })
        };

        tracker.begin_io();
        request.track(Arc::clone(&tracker));
        assert_eq!(tracker.pending(), 1);

        request.complete(Ok(()));

        // the submitter's callback runs while the request still counts
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "without a matching dispatch")]
    fn test_unpaired_completion_panics() {
        let tracker = IoTracker::new();
        tracker.end_io();
    }

    #[test]
    fn test_wait_idle_returns_immediately_when_idle() {
        let tracker = IoTracker::new();
        assert!(tracker.wait_idle(None));
        assert!(tracker.wait_idle(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_wait_idle_times_out_with_pending_io() {
        let tracker = IoTracker::new();
        tracker.begin_io();

        assert!(!tracker.wait_idle(Some(Duration::from_millis(20))));

        tracker.end_io();
        assert!(tracker.wait_idle(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_wait_idle_wakes_on_last_completion() {
        let tracker = Arc::new(IoTracker::new());
        for _ in 0..3 {
            tracker.begin_io();
        }

        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_idle(None))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        for _ in 0..3 {
            tracker.end_io();
        }
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = IoStats::new();
        stats.record_dispatch(Direction::Read, 8);
        stats.record_dispatch(Direction::Write, 16);
        stats.record_dispatch(Direction::Write, 16);
        stats.record_deferred();
        stats.record_replayed(3);
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.read_ops, 1);
        assert_eq!(snap.read_sectors, 8);
        assert_eq!(snap.write_ops, 2);
        assert_eq!(snap.write_sectors, 32);
        assert_eq!(snap.deferred_ops, 1);
        assert_eq!(snap.replayed_ops, 3);
        assert_eq!(snap.error_ops, 1);
    }
}
