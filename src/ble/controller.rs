//! Boundary to the link layer / host stack.
//!
//! Everything the pool and control plane need from the radio goes
//! through [`Controller`]. On target it is implemented over the
//! SoftDevice; tests use a recording mock.

use crate::ble::{AdvHandle, ConnHandle, LinkPhy, PhyMode, PowerTarget};
use crate::config;
use crate::telemetry::{ChannelId, NotifyTicket};

/// HCI status code returned by a rejected controller command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HciStatus(pub u8);

impl HciStatus {
    pub const UNKNOWN_CONNECTION_ID: Self = Self(0x02);
    pub const MEMORY_CAPACITY_EXCEEDED: Self = Self(0x07);
    pub const COMMAND_DISALLOWED: Self = Self(0x0C);
    pub const UNSUPPORTED_FEATURE: Self = Self(0x11);
    pub const INVALID_PARAMETERS: Self = Self(0x12);
    pub const UNKNOWN_ADVERTISING_ID: Self = Self(0x42);
    pub const LIMIT_REACHED: Self = Self(0x43);
}

/// Parameters for one extended advertising set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvParams {
    /// Advertising SID; the slot index, so scanners can tell sets apart.
    pub sid: u8,
    /// Interval range in 0.625 ms units.
    pub interval_min: u32,
    pub interval_max: u32,
    /// Primary and secondary PHY.
    pub phy: PhyMode,
    pub connectable: bool,
}

impl AdvParams {
    /// Connectable extended advertising for slot `sid` on `phy`.
    pub const fn connectable(sid: u8, phy: PhyMode) -> Self {
        Self {
            sid,
            interval_min: config::ADV_INTERVAL_MIN,
            interval_max: config::ADV_INTERVAL_MAX,
            phy,
            connectable: true,
        }
    }
}

/// Operations consumed from the link layer.
///
/// All methods are synchronous: they either complete or are accepted by
/// the controller before returning. Completions that arrive later (PHY
/// updates, notification TX) are reported back through events.
pub trait Controller {
    /// Vendor "set TX power". Returns the level the radio actually applied.
    fn set_tx_power(&self, target: PowerTarget, level: i8) -> Result<i8, HciStatus>;

    /// Read the current RSSI of a connection.
    fn read_rssi(&self, conn: ConnHandle) -> Result<i8, HciStatus>;

    /// Request a PHY update on a connection.
    fn set_phy(&self, conn: ConnHandle, phy: LinkPhy) -> Result<(), HciStatus>;

    /// Vendor connection update with an interval in microseconds.
    fn conn_update(
        &self,
        conn: ConnHandle,
        interval_us: u32,
        latency: u16,
        supervision_timeout: u16,
    ) -> Result<(), HciStatus>;

    /// Create an advertising set and load its data.
    fn adv_create(&self, params: &AdvParams, data: &[u8]) -> Result<AdvHandle, HciStatus>;
    fn adv_start(&self, adv: AdvHandle) -> Result<(), HciStatus>;
    fn adv_stop(&self, adv: AdvHandle) -> Result<(), HciStatus>;
    fn adv_delete(&self, adv: AdvHandle) -> Result<(), HciStatus>;

    /// Drop our reference to a connection that went down.
    fn release_connection(&self, conn: ConnHandle);

    /// Queue a notification. `ticket` must be handed back to
    /// [`TelemetryService::on_notification_complete`] once the
    /// transport is done with the payload.
    ///
    /// [`TelemetryService::on_notification_complete`]:
    ///     crate::telemetry::service::TelemetryService::on_notification_complete
    fn notify(
        &self,
        conn: ConnHandle,
        channel: ChannelId,
        value: &[u8],
        ticket: NotifyTicket,
    ) -> Result<(), HciStatus>;
}

/// Snap a requested level to the closest level the radio supports.
///
/// Ties go to the lower level.
pub fn nearest_supported_tx_power(level: i8) -> i8 {
    let table = &config::SUPPORTED_TX_POWER_DBM;
    let mut best = table[0];
    for &candidate in table.iter() {
        let d_best = (i16::from(best) - i16::from(level)).abs();
        let d_cand = (i16::from(candidate) - i16::from(level)).abs();
        if d_cand < d_best {
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_levels_are_kept() {
        for level in config::SUPPORTED_TX_POWER_DBM {
            assert_eq!(nearest_supported_tx_power(level), level);
        }
    }

    #[test]
    fn levels_snap_to_nearest_entry() {
        assert_eq!(nearest_supported_tx_power(-3), -4);
        assert_eq!(nearest_supported_tx_power(1), 0);
        assert_eq!(nearest_supported_tx_power(-30), -40);
        assert_eq!(nearest_supported_tx_power(-29), -20);
    }

    #[test]
    fn out_of_table_levels_clamp() {
        assert_eq!(nearest_supported_tx_power(20), 8);
        assert_eq!(nearest_supported_tx_power(-127), -40);
    }

    #[test]
    fn connectable_params_use_slot_as_sid() {
        let p = AdvParams::connectable(1, PhyMode::LongRangeRobust);
        assert_eq!(p.sid, 1);
        assert_eq!(p.interval_min, 0xA0);
        assert_eq!(p.interval_max, 0xF0);
        assert!(p.connectable);
    }
}
