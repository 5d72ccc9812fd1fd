//! Mapping tables
//!
//! A table assigns every sector of a mapped device to exactly one target.
//! Targets are appended in sector order by a single writer through
//! `TableBuilder`; `complete` freezes the result into a `MappingTable` with
//! its lookup index. A completed table is never edited, only dropped or
//! swapped for another one as a whole.

use crate::error::{MapperError, MapperResult};
use crate::index::{Index, SENTINEL};
use crate::target::{Target, TargetTypeHandle};
use devmapper_common::{DEFAULT_KEYS_PER_NODE, DeviceId, MAX_KEYS_PER_NODE, Sector};

use std::fmt;
use std::ops::RangeInclusive;

/// Underlying devices referenced by a table's targets
///
/// Insertion ordered, with a reference count per identity so several
/// targets may share one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDevices {
    entries: Vec<(DeviceId, usize)>,
}

impl TableDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reference to `device`
    pub fn get(&mut self, device: DeviceId) -> DeviceId {
        match self.entries.iter_mut().find(|(id, _)| *id == device) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((device.clone(), 1)),
        }
        device
    }

    /// Drop a reference taken with `get`
    pub fn put(&mut self, device: &DeviceId) {
        let position = self
            .entries
            .iter()
            .position(|(id, _)| id == device)
            .unwrap_or_else(|| panic!("device {device} put without a matching get"));

        self.entries[position].1 -= 1;
        if self.entries[position].1 == 0 {
            self.entries.remove(position);
        }
    }

    /// References held on `device`
    pub fn count(&self, device: &DeviceId) -> usize {
        self.entries
            .iter()
            .find(|(id, _)| id == device)
            .map_or(0, |(_, count)| *count)
    }

    /// Distinct devices in first-reference order
    pub fn iter(&self) -> impl Iterator<Item = &DeviceId> {
        self.entries.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A constructed target and the type it came from
struct TargetInstance {
    handle: TargetTypeHandle,
    target: Box<dyn Target>,
}

/// Targets, their end sectors and their devices
///
/// Shared by the builder and the completed table so destruction happens in
/// one place whichever of the two is dropped.
#[derive(Default)]
struct Entries {
    /// Inclusive end sector of each target; also the index leaf level
    highs: Vec<Sector>,
    targets: Vec<TargetInstance>,
    devices: TableDevices,
}

impl Drop for Entries {
    fn drop(&mut self) {
        let mut handles = Vec::with_capacity(self.targets.len());
        for TargetInstance { handle, target } in std::mem::take(&mut self.targets) {
            target.destroy(&mut self.devices);
            handles.push(handle);
        }
        // type references go back only after every destructor ran
        drop(handles);
    }
}

/// Sequential, single-writer table construction
pub struct TableBuilder {
    fanout: usize,
    entries: Entries,
}

impl TableBuilder {
    /// Create a builder with the default cache-line fan-out
    pub fn new() -> Self {
        Self::with_fanout(DEFAULT_KEYS_PER_NODE)
    }

    /// Create a builder whose index uses `fanout` keys per node
    pub fn with_fanout(fanout: usize) -> Self {
        assert!(
            (2..=MAX_KEYS_PER_NODE).contains(&fanout),
            "index fan-out {fanout} outside 2..={MAX_KEYS_PER_NODE}"
        );
        Self {
            fanout,
            entries: Entries {
                highs: Vec::with_capacity(fanout),
                targets: Vec::with_capacity(fanout),
                devices: TableDevices::new(),
            },
        }
    }

    /// Sector the next target must start at
    pub fn next_start(&self) -> Sector {
        self.entries.highs.last().map_or(0, |high| high + 1)
    }

    /// Number of targets added so far
    pub fn len(&self) -> usize {
        self.entries.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.targets.is_empty()
    }

    /// Devices referenced so far
    pub fn devices(&self) -> &TableDevices {
        &self.entries.devices
    }

    /// Construct a target covering `next_start()..=high` and append it.
    ///
    /// The caller is responsible for range contiguity; a `high` below the
    /// next start sector is reported as an overlap.
    pub fn add_target(
        &mut self,
        high: Sector,
        handle: TargetTypeHandle,
        args: &[String],
    ) -> MapperResult<()> {
        let start = self.next_start();

        if high == SENTINEL {
            return Err(MapperError::InvalidTarget {
                start,
                reason: format!("end sector {high} is reserved"),
            });
        }
        if high < start {
            return Err(MapperError::OverlappingRanges {
                index: self.len(),
                start: high,
                previous_high: start - 1,
            });
        }

        let length = high - start + 1;
        let target = handle
            .construct(&mut self.entries.devices, start, length, args)
            .map_err(|message| MapperError::TargetConstructorFailed {
                target: handle.name().to_string(),
                message,
            })?;

        self.entries.highs.push(high);
        self.entries
            .targets
            .push(TargetInstance { handle, target });
        Ok(())
    }

    /// Freeze the table and build its lookup index
    pub fn complete(self) -> MapperResult<MappingTable> {
        let Self {
            fanout,
            mut entries,
        } = self;

        if entries.targets.is_empty() {
            return Err(MapperError::EmptyTable);
        }

        if let Some(i) = entries.highs.windows(2).position(|w| w[1] <= w[0]) {
            return Err(MapperError::OverlappingRanges {
                index: i + 1,
                start: entries.highs[i + 1],
                previous_high: entries.highs[i],
            });
        }

        let end = entries.highs[entries.highs.len() - 1];
        let index = Index::build(&mut entries.highs, fanout);

        Ok(MappingTable {
            entries,
            index,
            end,
        })
    }
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TableBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableBuilder")
            .field("fanout", &self.fanout)
            .field("targets", &self.len())
            .field("next_start", &self.next_start())
            .finish()
    }
}

/// A completed sector → target table with its lookup index
pub struct MappingTable {
    entries: Entries,
    index: Index,
    /// Last mapped sector
    end: Sector,
}

impl MappingTable {
    /// Index of the target covering `sector`, or `None` past the end
    pub fn lookup(&self, sector: Sector) -> Option<usize> {
        if sector > self.end {
            return None;
        }
        Some(self.index.lookup(&self.entries.highs, sector))
    }

    /// Number of targets
    pub fn len(&self) -> usize {
        self.entries.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.targets.is_empty()
    }

    /// Mapped size in sectors
    pub fn size(&self) -> Sector {
        self.end + 1
    }

    /// Levels in the lookup tree, leaf level included
    pub fn depth(&self) -> usize {
        self.index.depth()
    }

    /// Keys per index node
    pub fn fanout(&self) -> usize {
        self.index.fanout()
    }

    /// Bytes used by index levels above the leaves
    pub fn index_bytes(&self) -> usize {
        self.index.memory_bytes()
    }

    /// Underlying devices the table's targets address
    pub fn devices(&self) -> &TableDevices {
        &self.entries.devices
    }

    /// Target instance `i`
    pub fn target(&self, i: usize) -> Option<&dyn Target> {
        self.entries.targets.get(i).map(|t| t.target.as_ref())
    }

    /// Type name of target `i`
    pub fn target_type(&self, i: usize) -> Option<&str> {
        self.entries.targets.get(i).map(|t| t.handle.name())
    }

    /// Sector range covered by target `i`
    pub fn range(&self, i: usize) -> Option<RangeInclusive<Sector>> {
        if i >= self.len() {
            return None;
        }
        let start = if i == 0 {
            0
        } else {
            self.entries.highs[i - 1] + 1
        };
        Some(start..=self.entries.highs[i])
    }

    /// One `<start> <length> <type> <args>` line per target
    pub fn status_lines(&self) -> Vec<String> {
        (0..self.len())
            .filter_map(|i| {
                let range = self.range(i)?;
                let instance = &self.entries.targets[i];
                let length = range.end() - range.start() + 1;
                let args = instance.target.describe();
                let line = if args.is_empty() {
                    format!("{} {} {}", range.start(), length, instance.handle.name())
                } else {
                    format!(
                        "{} {} {} {}",
                        range.start(),
                        length,
                        instance.handle.name(),
                        args
                    )
                };
                Some(line)
            })
            .collect()
    }
}

impl fmt::Debug for MappingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingTable")
            .field("targets", &self.len())
            .field("size", &self.size())
            .field("depth", &self.depth())
            .field("devices", &self.entries.devices)
            .finish()
    }
}
