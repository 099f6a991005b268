//! nRF52840 + S140 bindings for the firmware binary.

pub mod gatt;
pub mod softdevice;
