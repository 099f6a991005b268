//! BLE connection/advertising pair pool and link-quality control plane.
//!
//! The device keeps one connectable extended advertising set per pool
//! slot, each on its own PHY (LE 1M or LE Coded). When a central connects
//! to a set, the slot owns that connection until it drops, then
//! advertises again. A GATT service exposes per-link transmit power and
//! RSSI with notifications throttled to one in flight per link and
//! characteristic.
//!
//! Everything here is host-testable: the radio is reached only through
//! [`ble::controller::Controller`]. The nRF52840 firmware in `main.rs`
//! (feature `embedded`) implements it over the S140 SoftDevice.
//!
//! Usage: `cargo test` on the host, `cargo run --release --features embedded`
//! on target.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
mod fmt;

pub mod admin;
pub mod ble;
pub mod config;
pub mod error;
pub mod telemetry;

#[cfg(test)]
mod mock;

pub use ble::facade::LinkControl;
pub use ble::pool::{PairPool, PowerSetting, SlotSnapshot, SlotState};
pub use error::Error;
pub use telemetry::service::TelemetryService;
