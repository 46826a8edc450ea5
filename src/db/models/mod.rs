//! Database models, one file per table.

pub mod device;

pub use self::device::*;
