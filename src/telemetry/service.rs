//! Link Control Service.
//!
//! Attribute callbacks for the characteristics in
//! [`DESCRIPTORS`](super::DESCRIPTORS), and the only path notifications
//! take to the controller. Every notification goes through the
//! `(slot, characteristic)` gate; when the gate is busy the value is
//! still stored but that notification is skipped.
//!
//! A power write only ever commits the level the radio applied.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::ble::controller::Controller;
use crate::ble::facade::LinkControl;
use crate::ble::pool::{PairPool, PowerSetting};
use crate::ble::{ConnHandle, LinkEvent};
use crate::config;
use crate::error::Error;
use crate::telemetry::flow::{NotifyGate, Permit};
use crate::telemetry::scheduler::RssiScheduler;
use crate::telemetry::{AttError, ChannelId, NotifyTicket, TelemetryChannel, CHANNEL_COUNT};

pub struct TelemetryService<'a, M: RawMutex, C: Controller, const N: usize> {
    pool: &'a PairPool<'a, M, C, N>,
    channels: [TelemetryChannel; CHANNEL_COUNT],
    gates: [[NotifyGate<M>; CHANNEL_COUNT]; N],
    scheduler: RssiScheduler<M>,
}

impl<'a, M: RawMutex, C: Controller, const N: usize> TelemetryService<'a, M, C, N> {
    pub fn new(pool: &'a PairPool<'a, M, C, N>) -> Self {
        Self {
            pool,
            channels: core::array::from_fn(|_| TelemetryChannel::new()),
            gates: core::array::from_fn(|_| core::array::from_fn(|_| NotifyGate::new())),
            scheduler: RssiScheduler::new(config::RSSI_POLL_INTERVAL_MS),
        }
    }

    pub fn pool(&self) -> &'a PairPool<'a, M, C, N> {
        self.pool
    }

    pub fn link(&self) -> &'a LinkControl<C> {
        self.pool.link()
    }

    pub fn channel(&self, id: ChannelId) -> &TelemetryChannel {
        &self.channels[id.index()]
    }

    pub fn scheduler(&self) -> &RssiScheduler<M> {
        &self.scheduler
    }

    pub fn gate(&self, slot: usize, id: ChannelId) -> Option<&NotifyGate<M>> {
        self.gates.get(slot).map(|g| &g[id.index()])
    }

    pub fn is_notify_enabled(&self, id: ChannelId) -> bool {
        self.channel(id).notify_enabled()
    }

    // ------------------------------------------------------------------
    // Attribute callbacks
    // ------------------------------------------------------------------

    pub fn on_read(&self, id: ChannelId) -> Result<[u8; 1], AttError> {
        if !id.descriptor().props.read {
            return Err(AttError::ReadNotPermitted);
        }
        Ok([self.channel(id).value() as u8])
    }

    /// Write from the central on `conn`.
    ///
    /// The new power is applied to the writer's own link. On any failure
    /// the characteristic keeps its previous value.
    pub fn on_write(
        &self,
        conn: ConnHandle,
        id: ChannelId,
        data: &[u8],
        offset: u16,
    ) -> Result<(), AttError> {
        if !id.descriptor().props.write {
            return Err(AttError::WriteNotPermitted);
        }
        if usize::from(offset) + data.len() > 1 {
            return Err(AttError::InvalidOffset);
        }
        let Some(&byte) = data.first() else {
            return Err(AttError::InvalidAttributeValueLength);
        };

        let level = byte as i8;
        let Some(slot) = self.pool.slot_of_conn(conn) else {
            warn!("[lcs] write from unknown {:?}", conn);
            return Err(Error::HandleStale.into());
        };

        match self.apply_conn_tx_power(slot, level) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("[lcs] slot {}: tx power {} rejected: {:?}", slot, level, e);
                Err(e.into())
            }
        }
    }

    /// Set the connection power of `slot` and publish the applied level.
    ///
    /// Shared by the protocol write and the admin command. A slot without
    /// a live connection only stores the level; the characteristic is
    /// updated once a connection applies it.
    pub fn apply_conn_tx_power(&self, slot: usize, level: i8) -> Result<PowerSetting, Error> {
        if !(config::TX_POWER_MIN_DBM..=config::TX_POWER_MAX_DBM).contains(&level) {
            return Err(Error::ValueOutOfRange);
        }

        let setting = self.pool.set_conn_tx_power(slot, level)?;
        match setting {
            PowerSetting::Applied(applied) => {
                info!("[lcs] slot {}: conn tx power {} dBm", slot, applied);
                self.publish_conn_tx_power(slot);
            }
            PowerSetting::Stored(stored) => {
                debug!("[lcs] slot {}: conn tx power {} dBm stored", slot, stored);
            }
        }
        Ok(setting)
    }

    /// Expose the level `slot`'s live connection runs at.
    fn publish_conn_tx_power(&self, slot: usize) {
        let Some(snap) = self.pool.snapshot(slot) else {
            return;
        };
        let Some(conn) = snap.conn else {
            return;
        };
        let channel = self.channel(ChannelId::ConnTxPower);
        channel.set_value(snap.tx_power_conn);
        if channel.notify_enabled() {
            self.notify_value(slot, conn, ChannelId::ConnTxPower, snap.tx_power_conn);
        }
    }

    /// CCCD write. Returns `false` when the setting did not change.
    pub fn on_subscription_changed(&self, id: ChannelId, enabled: bool) -> bool {
        if !id.descriptor().props.notify {
            return false;
        }
        if self.channel(id).set_notify_enabled(enabled) == enabled {
            return false;
        }
        info!("[lcs] {:?} notifications {}", id, if enabled { "on" } else { "off" });

        if id == ChannelId::LocalRssi {
            if enabled {
                self.scheduler.start();
            } else {
                self.scheduler.stop();
            }
        }
        true
    }

    /// Transport completion for a notification sent by this service.
    pub fn on_notification_complete(&self, ticket: NotifyTicket) -> bool {
        match self.gate(usize::from(ticket.slot), ticket.channel) {
            Some(gate) => gate.complete(ticket.seq),
            None => {
                warn!("[flow] completion for unknown slot {}", ticket.slot);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Store the peer's own RSSI sample and push it to every connected
    /// subscriber. Returns the number of notifications sent.
    pub fn report_remote_rssi(&self, conn: ConnHandle, rssi: i8) -> usize {
        let channel = self.channel(ChannelId::RemoteRssi);
        channel.set_value(rssi);
        debug!("[lcs] remote rssi {} from {:?}", rssi, conn);

        if !channel.notify_enabled() {
            return 0;
        }
        self.pool
            .connected_links()
            .into_iter()
            .filter(|&(slot, link)| self.notify_value(slot, link, ChannelId::RemoteRssi, rssi))
            .count()
    }

    /// Store a local RSSI sample for `slot` and notify if subscribed.
    pub fn publish_local_rssi(&self, slot: usize, conn: ConnHandle, rssi: i8) -> bool {
        let channel = self.channel(ChannelId::LocalRssi);
        channel.set_value(rssi);
        channel.notify_enabled() && self.notify_value(slot, conn, ChannelId::LocalRssi, rssi)
    }

    /// Send one notification if the gate is free; otherwise skip it.
    pub fn notify(&self, slot: usize, conn: ConnHandle, id: ChannelId, value: &[u8]) -> bool {
        let Some(gate) = self.gate(slot, id) else {
            return false;
        };
        match gate.try_acquire() {
            Some(permit) => self.submit(permit, slot, conn, id, value),
            None => {
                debug!("[flow] slot {} {:?} busy, skipped", slot, id);
                false
            }
        }
    }

    fn notify_value(&self, slot: usize, conn: ConnHandle, id: ChannelId, value: i8) -> bool {
        self.notify(slot, conn, id, &[value as u8])
    }

    pub(crate) fn submit(
        &self,
        permit: Permit<'_, M>,
        slot: usize,
        conn: ConnHandle,
        id: ChannelId,
        value: &[u8],
    ) -> bool {
        let controller = self.link().controller();
        let result = permit.submit(|seq| {
            let ticket = NotifyTicket {
                slot: slot as u8,
                channel: id,
                seq,
            };
            controller.notify(conn, id, value, ticket)
        });

        match result {
            Ok(()) => true,
            Err(status) => {
                warn!("[flow] slot {} {:?} notify failed: {:?}", slot, id, status);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Events and tasks
    // ------------------------------------------------------------------

    /// Forward a link event to the pool. Gates of a lost connection are
    /// reset before the slot is re-armed; a new connection publishes the
    /// power level applied to it.
    pub async fn dispatch(&self, event: LinkEvent) -> Result<Option<usize>, Error> {
        if let LinkEvent::Disconnected { conn, .. } = event {
            if let Some(slot) = self.pool.slot_of_conn(conn) {
                self.reset_gates(slot);
            }
        }
        let applied = self.pool.dispatch(event).await?;
        if let (LinkEvent::AdvertiserConnected { .. }, Some(slot)) = (event, applied) {
            self.publish_conn_tx_power(slot);
        }
        Ok(applied)
    }

    /// Administrative teardown of `slot`. Notifications still in flight
    /// on its connection are abandoned with it.
    pub fn free(&self, slot: usize) -> Result<(), Error> {
        if slot >= N {
            return Err(Error::NoSuchSlot);
        }
        self.reset_gates(slot);
        self.pool.free(slot)
    }

    fn reset_gates(&self, slot: usize) {
        if let Some(gates) = self.gates.get(slot) {
            gates.iter().for_each(NotifyGate::reset);
        }
    }

    pub async fn run_rssi_polling(&self) -> ! {
        self.scheduler.run(self).await
    }
}
