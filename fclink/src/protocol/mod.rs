//! Protocol implementations.

pub mod ardupilot;
pub mod crc;
pub mod mavlink;

// Re-export common helpers
pub use crc::{crc32, crc32_erased};
