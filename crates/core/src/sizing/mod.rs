//! Machine sizing for remote ingest jobs.
//!
//! Maps an input file size and a per-action memory coefficient onto the
//! smallest allow-listed machine tier that fits.

mod catalog;
mod config;
mod sizer;

pub use catalog::{MachineCatalog, MachineSpec, GIB_PER_CORE, MACHINE_FAMILY};
pub use config::{GbPerCore, SizingConfig};
pub use sizer::{ResourceSizer, SizingError};
