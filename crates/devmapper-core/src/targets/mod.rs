//! Built-in target types
//!
//! - `linear <device> <offset>`: a contiguous window onto one device
//! - `error`: fails every request
//! - `striped <stripes> <chunk_sectors> (<device> <offset>)...`: round-robin
//!   by chunk across several devices

mod error;
mod linear;
mod striped;

pub use error::ErrorType;
pub use linear::LinearType;
pub use striped::StripedType;

use crate::target::TargetType;
use devmapper_common::Sector;

use std::str::FromStr;
use std::sync::Arc;

/// Target types every registry starts with
pub fn builtins() -> Vec<Arc<dyn TargetType>> {
    vec![
        Arc::new(LinearType),
        Arc::new(ErrorType),
        Arc::new(StripedType),
    ]
}

/// Fetch argument `index`, naming it in the error
fn arg<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {what}"))
}

/// Parse argument `index` as a number
fn number<T: FromStr>(args: &[String], index: usize, what: &str) -> Result<T, String> {
    let raw = arg(args, index, what)?;
    raw.parse()
        .map_err(|_| format!("invalid {what}: {raw}"))
}

/// Parse a sector offset argument
fn sector(args: &[String], index: usize, what: &str) -> Result<Sector, String> {
    number(args, index, what)
}
