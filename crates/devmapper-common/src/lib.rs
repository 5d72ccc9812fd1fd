//! Devmapper Common - Shared types and configuration
//!
//! This crate provides the identifiers, sector constants and configuration
//! model shared by the devmapper engine and anything embedding it.

pub mod config;
pub mod types;

pub use config::{ConfigError, MapperConfig, SuspendConfig};
pub use types::*;
