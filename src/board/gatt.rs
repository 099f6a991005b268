//! GATT table for the Link Control Service.
//!
//! The SoftDevice answers reads from its own attribute table, so values
//! published by the service are mirrored into it with [`Server::sync`].

use defmt::warn;
use nrf_softdevice::ble::Connection;

use linkpool::ble::ConnHandle;
use linkpool::telemetry::ChannelId;

use crate::Service;

#[nrf_softdevice::gatt_service(uuid = "430ebad0-5c25-469e-a162-a1c9dc50a8fd")]
pub struct LinkControlService {
    #[characteristic(uuid = "430ebad1-5c25-469e-a162-a1c9dc50a8fd", read, write, notify)]
    pub conn_tx_power: i8,
    #[characteristic(uuid = "430ebad2-5c25-469e-a162-a1c9dc50a8fd", read, notify)]
    pub local_rssi: i8,
    #[characteristic(uuid = "430ebad3-5c25-469e-a162-a1c9dc50a8fd", notify)]
    pub throughput: [u8; 244],
    #[characteristic(uuid = "430ebad4-5c25-469e-a162-a1c9dc50a8fd", read, notify)]
    pub remote_rssi: i8,
}

#[nrf_softdevice::gatt_server]
pub struct Server {
    pub lcs: LinkControlService,
}

impl Server {
    pub fn value_handle(&self, id: ChannelId) -> u16 {
        match id {
            ChannelId::ConnTxPower => self.lcs.conn_tx_power_value_handle,
            ChannelId::LocalRssi => self.lcs.local_rssi_value_handle,
            ChannelId::Throughput => self.lcs.throughput_value_handle,
            ChannelId::RemoteRssi => self.lcs.remote_rssi_value_handle,
        }
    }

    /// Copy the service's current values into the attribute table.
    pub fn sync(&self, service: &Service) {
        let lcs = &self.lcs;
        let results = [
            lcs.conn_tx_power_set(&service.channel(ChannelId::ConnTxPower).value()),
            lcs.local_rssi_set(&service.channel(ChannelId::LocalRssi).value()),
            lcs.remote_rssi_set(&service.channel(ChannelId::RemoteRssi).value()),
        ];
        if results.iter().any(Result::is_err) {
            warn!("[lcs] attribute table update failed");
        }
    }

    /// Route one GATT server event of the connection `conn` to the service.
    pub fn handle(&self, service: &Service, conn: &Connection, event: ServerEvent) {
        let Some(handle) = conn.handle() else {
            return;
        };
        let ServerEvent::Lcs(event) = event;

        match event {
            LinkControlServiceEvent::ConnTxPowerWrite(level) => {
                let written = service.on_write(
                    ConnHandle(handle),
                    ChannelId::ConnTxPower,
                    &[level as u8],
                    0,
                );
                if let Err(e) = written {
                    warn!("[lcs] tx power write rejected (att {:#x})", e.code());
                }
                // The table holds the written value; put the applied one back.
                self.sync(service);
            }
            LinkControlServiceEvent::ConnTxPowerCccdWrite { notifications } => {
                service.on_subscription_changed(ChannelId::ConnTxPower, notifications);
            }
            LinkControlServiceEvent::LocalRssiCccdWrite { notifications } => {
                service.on_subscription_changed(ChannelId::LocalRssi, notifications);
            }
            LinkControlServiceEvent::ThroughputCccdWrite { notifications } => {
                service.on_subscription_changed(ChannelId::Throughput, notifications);
            }
            LinkControlServiceEvent::RemoteRssiCccdWrite { notifications } => {
                service.on_subscription_changed(ChannelId::RemoteRssi, notifications);
            }
        }
    }
}
