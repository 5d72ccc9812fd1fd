//! Table construction from target lines
//!
//! Validates that the lines tile the device from sector 0 without gaps or
//! overlaps, resolves each target type and feeds the builder. On any failure
//! the partial table is dropped, running the destructors of every target
//! constructed so far.

use crate::error::{MapperError, MapperResult};
use crate::table::{MappingTable, TableBuilder};
use crate::target::TargetRegistry;
use devmapper_common::{ConfigError, MAX_KEYS_PER_NODE, Sector};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One line of a table: `<start> <length> <type> <args...>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub start: Sector,
    pub length: Sector,
    pub target_type: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl TargetSpec {
    pub fn new(
        start: Sector,
        length: Sector,
        target_type: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            start,
            length,
            target_type: target_type.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Build a complete table from ordered target lines
pub fn load_table(
    registry: &TargetRegistry,
    fanout: usize,
    specs: &[TargetSpec],
) -> MapperResult<MappingTable> {
    if fanout < 2 {
        return Err(ConfigError::FanoutTooSmall(fanout).into());
    }
    if fanout > MAX_KEYS_PER_NODE {
        return Err(ConfigError::FanoutTooLarge(fanout).into());
    }

    let mut builder = TableBuilder::with_fanout(fanout);

    for (index, spec) in specs.iter().enumerate() {
        let expected = builder.next_start();

        if spec.start > expected {
            return Err(MapperError::GapInRanges {
                expected,
                found: spec.start,
            });
        }
        if spec.start < expected {
            return Err(MapperError::OverlappingRanges {
                index,
                start: spec.start,
                previous_high: expected - 1,
            });
        }
        if spec.length == 0 {
            return Err(MapperError::InvalidTarget {
                start: spec.start,
                reason: "zero length".to_string(),
            });
        }

        let high = spec
            .start
            .checked_add(spec.length - 1)
            .ok_or_else(|| MapperError::InvalidTarget {
                start: spec.start,
                reason: format!("length {} overflows the sector space", spec.length),
            })?;

        let handle = registry.lookup(&spec.target_type)?;
        builder.add_target(high, handle, &spec.args)?;
    }

    let table = builder.complete()?;
    debug!(
        "Loaded table: {} targets, {} sectors, depth {}",
        table.len(),
        table.size(),
        table.depth()
    );
    Ok(table)
}
