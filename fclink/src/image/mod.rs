//! Firmware image containers.

pub mod apj;

pub use apj::FirmwareImage;
