//! Link Control Facade.
//!
//! Stateless wrapper over the vendor/link operations used by the pool
//! and the telemetry service. Errors are mapped and returned; nothing
//! here retries.

use crate::ble::controller::Controller;
use crate::ble::{ConnHandle, LinkPhy, PowerTarget};
use crate::config;
use crate::error::Error;

/// HCI "RSSI not available" sentinel.
const RSSI_UNAVAILABLE: i8 = 127;

pub struct LinkControl<C> {
    controller: C,
}

impl<C: Controller> LinkControl<C> {
    pub const fn new(controller: C) -> Self {
        Self { controller }
    }

    /// Direct access for advertising-set management.
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Apply a transmit power level.
    ///
    /// Returns the level the radio applied, which may differ from `level`
    /// after hardware quantization. Callers must store the returned value.
    pub fn set_transmit_power(&self, target: PowerTarget, level: i8) -> Result<i8, Error> {
        let applied = self.controller.set_tx_power(target, level)?;
        if applied != level {
            debug!(
                "[link] tx power {:?}: requested {} applied {}",
                target,
                level,
                applied
            );
        }
        Ok(applied)
    }

    /// Read the RSSI of a live connection.
    ///
    /// `HandleStale` means the link is already gone; callers skip the
    /// cycle.
    pub fn read_signal_strength(&self, conn: ConnHandle) -> Result<i8, Error> {
        match self.controller.read_rssi(conn)? {
            RSSI_UNAVAILABLE => Err(Error::NotSupported),
            rssi => Ok(rssi),
        }
    }

    /// Ask for a PHY change. `Ok` only means the request was accepted.
    pub fn request_phy_change(&self, conn: ConnHandle, phy: LinkPhy) -> Result<(), Error> {
        self.controller.set_phy(conn, phy)?;
        Ok(())
    }

    /// Vendor connection update (latency 0, 3 s supervision timeout).
    pub fn set_connection_interval(&self, conn: ConnHandle, interval_us: u32) -> Result<(), Error> {
        self.controller.conn_update(
            conn,
            interval_us,
            config::CONN_SLAVE_LATENCY,
            config::CONN_SUP_TIMEOUT,
        )?;
        Ok(())
    }
}
