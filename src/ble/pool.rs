//! Connection/advertising pair pool.
//!
//! A fixed array of slots, one per concurrent peripheral link. Each slot
//! owns an extended advertising set on its own PHY until a central
//! connects, then owns that connection until it drops, then advertises
//! again:
//!
//! ```text
//! Free --allocate--> Advertising --advertiser connected--> Connected
//! Advertising --free--> Free
//! Connected --link lost--> Disconnecting --restart--> Advertising
//! ```
//!
//! Slots are located from link events by handle comparison, never by
//! reference. Each slot has its own lock; no operation holds two.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};
use heapless::Vec;

use crate::ble::controller::{AdvParams, Controller};
use crate::ble::facade::LinkControl;
use crate::ble::{AdvHandle, ConnHandle, LinkEvent, PhyMode, PowerTarget};
use crate::config;
use crate::error::Error;

/// Lifecycle state of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    /// Unused; holds no handles.
    Free,
    /// Advertising set running, waiting for a central.
    Advertising,
    /// Owns a live connection; advertising set destroyed.
    Connected,
    /// Connection released, advertising not (yet) running again.
    Disconnecting,
}

/// Result of a power change on a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerSetting {
    /// The radio applied this level to a live handle.
    Applied(i8),
    /// No live handle; kept for the next connection or advertiser.
    Stored(i8),
}

impl PowerSetting {
    pub const fn level(self) -> i8 {
        match self {
            PowerSetting::Applied(level) | PowerSetting::Stored(level) => level,
        }
    }
}

/// Point-in-time copy of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotSnapshot {
    pub index: usize,
    pub state: SlotState,
    pub phy: PhyMode,
    pub conn: Option<ConnHandle>,
    pub adv: Option<AdvHandle>,
    pub tx_power_conn: i8,
    pub tx_power_adv: i8,
    pub last_rssi: Option<i8>,
}

struct SlotInner {
    state: SlotState,
    phy: PhyMode,
    conn: Option<ConnHandle>,
    adv: Option<AdvHandle>,
    tx_power_conn: i8,
    tx_power_adv: i8,
    last_rssi: Option<i8>,
    payload: Vec<u8, { config::ADV_DATA_MAX_LEN }>,
}

impl SlotInner {
    const fn free() -> Self {
        Self {
            state: SlotState::Free,
            phy: PhyMode::FastShortRange,
            conn: None,
            adv: None,
            tx_power_conn: config::DEFAULT_CONN_TX_POWER_DBM,
            tx_power_adv: config::DEFAULT_ADV_TX_POWER_DBM,
            last_rssi: None,
            payload: Vec::new(),
        }
    }
}

/// One connection/advertising pair.
struct LinkSlot<M: RawMutex> {
    index: usize,
    inner: Mutex<M, RefCell<SlotInner>>,
    /// Given when the slot reaches Connected or re-enters Advertising.
    handoff: Signal<M, ()>,
}

impl<M: RawMutex> LinkSlot<M> {
    fn new(index: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(RefCell::new(SlotInner::free())),
            handoff: Signal::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SlotInner) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn snapshot(&self) -> SlotSnapshot {
        self.with(|s| SlotSnapshot {
            index: self.index,
            state: s.state,
            phy: s.phy,
            conn: s.conn,
            adv: s.adv,
            tx_power_conn: s.tx_power_conn,
            tx_power_adv: s.tx_power_adv,
            last_rssi: s.last_rssi,
        })
    }
}

pub struct PairPool<'a, M: RawMutex, C: Controller, const N: usize> {
    link: &'a LinkControl<C>,
    slots: [LinkSlot<M>; N],
}

impl<'a, M: RawMutex, C: Controller, const N: usize> PairPool<'a, M, C, N> {
    pub fn new(link: &'a LinkControl<C>) -> Self {
        Self {
            link,
            slots: core::array::from_fn(LinkSlot::new),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn link(&self) -> &'a LinkControl<C> {
        self.link
    }

    /// Claim the first free slot and start advertising on it.
    ///
    /// The advertising set uses the slot index as its SID. Any failure
    /// leaves the slot Free; `PoolExhausted` touches no slot at all.
    pub fn allocate(
        &self,
        phy: PhyMode,
        tx_power_conn: i8,
        tx_power_adv: i8,
        payload: &[u8],
    ) -> Result<usize, Error> {
        let payload: Vec<u8, { config::ADV_DATA_MAX_LEN }> =
            Vec::from_slice(payload).map_err(|_| Error::PayloadTooLarge)?;

        for slot in self.slots.iter() {
            let outcome = slot.with(|s| {
                if s.state != SlotState::Free {
                    return None;
                }
                let mut fresh = SlotInner {
                    phy,
                    tx_power_conn,
                    tx_power_adv,
                    payload: payload.clone(),
                    ..SlotInner::free()
                };
                let result = self.begin_advertising(slot.index, &mut fresh);
                if result.is_ok() {
                    *s = fresh;
                }
                Some(result)
            });

            match outcome {
                None => continue,
                Some(Ok(())) => {
                    info!("[pool] slot {} allocated on {:?}", slot.index, phy);
                    return Ok(slot.index);
                }
                Some(Err(e)) => {
                    warn!("[pool] slot {} allocation failed: {:?}", slot.index, e);
                    return Err(e);
                }
            }
        }

        warn!("[pool] no free slot");
        Err(Error::PoolExhausted)
    }

    /// A central connected to one of our advertising sets.
    ///
    /// The slot whose advertiser matches `adv` stops and destroys it, takes
    /// ownership of `conn` and applies its connection power.
    pub fn on_connection_established(&self, adv: AdvHandle, conn: ConnHandle) -> Result<usize, Error> {
        if let Some(owner) = self.slot_of_conn(conn) {
            warn!("[pool] {:?} already owned by slot {}", conn, owner);
            return Err(Error::InconsistentEvent);
        }

        for slot in self.slots.iter() {
            let claimed = slot.with(|s| {
                if s.state != SlotState::Advertising || s.adv != Some(adv) {
                    return false;
                }
                self.retire_advertiser(slot.index, adv);
                s.adv = None;
                s.conn = Some(conn);
                s.last_rssi = None;
                s.state = SlotState::Connected;

                match self
                    .link
                    .set_transmit_power(PowerTarget::Connection(conn), s.tx_power_conn)
                {
                    Ok(applied) => s.tx_power_conn = applied,
                    Err(e) => warn!(
                        "[pool] slot {}: conn tx power {} not applied: {:?}",
                        slot.index,
                        s.tx_power_conn,
                        e
                    ),
                }
                true
            });

            if claimed {
                info!("[pool] slot {} connected as {:?}", slot.index, conn);
                slot.handoff.signal(());
                return Ok(slot.index);
            }
        }

        warn!("[pool] connection on unknown advertiser {:?} dropped", adv);
        Err(Error::InconsistentEvent)
    }

    /// A connection owned by the pool went down.
    ///
    /// Releases the connection, re-arms advertising for the same slot and
    /// waits up to `HANDOFF_TIMEOUT_MS` for the slot to settle. A timeout
    /// is only logged. An advertiser failure leaves the slot in
    /// Disconnecting and is returned.
    pub async fn on_connection_lost(&self, conn: ConnHandle) -> Result<usize, Error> {
        let Some(index) = self.slot_of_conn(conn) else {
            warn!("[pool] connection {:?} not found", conn);
            return Err(Error::InconsistentEvent);
        };
        let slot = &self.slots[index];
        slot.handoff.reset();

        let released = slot.with(|s| {
            if s.conn != Some(conn) {
                return false;
            }
            s.conn = None;
            s.last_rssi = None;
            s.state = SlotState::Disconnecting;
            true
        });
        if !released {
            warn!("[pool] slot {} lost {:?} concurrently", index, conn);
            return Err(Error::InconsistentEvent);
        }
        self.link.controller().release_connection(conn);
        info!("[pool] slot {} released {:?}", index, conn);

        let restarted = self.restart_advertising(index);

        let wait = with_timeout(
            Duration::from_millis(config::HANDOFF_TIMEOUT_MS),
            slot.handoff.wait(),
        );
        if wait.await.is_err() {
            warn!("[pool] slot {} handoff timed out", index);
        }

        restarted.map(|()| index)
    }

    /// Recreate and start the advertising set of a Disconnecting slot.
    ///
    /// No retry here; a supervisor may call this again for a slot left
    /// in limbo by an earlier failure.
    pub fn restart_advertising(&self, index: usize) -> Result<(), Error> {
        let slot = self.slots.get(index).ok_or(Error::NoSuchSlot)?;
        let result = slot.with(|s| {
            if s.state != SlotState::Disconnecting {
                return Err(Error::InvalidState);
            }
            self.begin_advertising(index, s)
        });

        match result {
            Ok(()) => slot.handoff.signal(()),
            Err(e) => warn!("[adv] set {} restart failed: {:?}", index, e),
        }
        result
    }

    /// Administrative reset to Free, whatever the slot is doing.
    pub fn free(&self, index: usize) -> Result<(), Error> {
        let slot = self.slots.get(index).ok_or(Error::NoSuchSlot)?;
        let (adv, conn) = slot.with(|s| {
            let handles = (s.adv.take(), s.conn.take());
            *s = SlotInner::free();
            handles
        });

        if let Some(adv) = adv {
            self.retire_advertiser(index, adv);
        }
        if let Some(conn) = conn {
            self.link.controller().release_connection(conn);
        }
        slot.handoff.reset();
        info!("[pool] slot {} freed", index);
        Ok(())
    }

    /// Single entry point for link-layer events.
    ///
    /// Returns the slot the event was applied to, if any.
    pub async fn dispatch(&self, event: LinkEvent) -> Result<Option<usize>, Error> {
        match event {
            LinkEvent::Connected { conn, role, status } => {
                if status != 0 {
                    warn!("[pool] {:?} link {:?} failed (status {:#x})", role, conn, status);
                } else {
                    debug!("[pool] {:?} link {:?} up", role, conn);
                }
                Ok(None)
            }
            LinkEvent::AdvertiserConnected { adv, conn } => {
                self.on_connection_established(adv, conn).map(Some)
            }
            LinkEvent::Disconnected { conn, reason } => {
                info!("[pool] {:?} disconnected (reason {:#x})", conn, reason);
                self.on_connection_lost(conn).await.map(Some)
            }
        }
    }

    /// Change the connection power of a slot.
    ///
    /// Applied immediately when the slot is Connected, otherwise stored
    /// for the next connection. Only the applied level is kept.
    pub fn set_conn_tx_power(&self, index: usize, level: i8) -> Result<PowerSetting, Error> {
        let slot = self.slots.get(index).ok_or(Error::NoSuchSlot)?;
        slot.with(|s| {
            let setting = match (s.state, s.conn) {
                (SlotState::Free, _) => return Err(Error::InvalidState),
                (SlotState::Connected, Some(conn)) => PowerSetting::Applied(
                    self.link
                        .set_transmit_power(PowerTarget::Connection(conn), level)?,
                ),
                _ => PowerSetting::Stored(level),
            };
            s.tx_power_conn = setting.level();
            Ok(setting)
        })
    }

    /// Change the advertising power of a slot. Same rules as
    /// [`set_conn_tx_power`](Self::set_conn_tx_power).
    pub fn set_adv_tx_power(&self, index: usize, level: i8) -> Result<PowerSetting, Error> {
        let slot = self.slots.get(index).ok_or(Error::NoSuchSlot)?;
        slot.with(|s| {
            let setting = match (s.state, s.adv) {
                (SlotState::Free, _) => return Err(Error::InvalidState),
                (SlotState::Advertising, Some(adv)) => PowerSetting::Applied(
                    self.link
                        .set_transmit_power(PowerTarget::Advertiser(adv), level)?,
                ),
                _ => PowerSetting::Stored(level),
            };
            s.tx_power_adv = setting.level();
            Ok(setting)
        })
    }

    /// Store an RSSI sample if the slot still owns `conn`.
    pub fn record_rssi(&self, index: usize, conn: ConnHandle, rssi: i8) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        slot.with(|s| {
            if s.state == SlotState::Connected && s.conn == Some(conn) {
                s.last_rssi = Some(rssi);
                true
            } else {
                false
            }
        })
    }

    pub fn snapshot(&self, index: usize) -> Option<SlotSnapshot> {
        self.slots.get(index).map(LinkSlot::snapshot)
    }

    pub fn snapshots(&self) -> Vec<SlotSnapshot, N> {
        self.slots.iter().map(LinkSlot::snapshot).collect()
    }

    pub fn slot_of_conn(&self, conn: ConnHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.with(|s| s.conn == Some(conn)))
    }

    pub fn slot_of_adv(&self, adv: AdvHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.with(|s| s.adv == Some(adv)))
    }

    /// `(slot, connection)` for every Connected slot.
    pub fn connected_links(&self) -> Vec<(usize, ConnHandle), N> {
        let mut links = Vec::new();
        for slot in self.slots.iter() {
            if let Some(conn) = slot.with(|s| s.conn.filter(|_| s.state == SlotState::Connected)) {
                let _ = links.push((slot.index, conn));
            }
        }
        links
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.with(|s| s.state != SlotState::Free))
            .count()
    }

    /// Create, load and start the slot's advertising set, then apply its
    /// advertising power. `s` is only modified on success.
    fn begin_advertising(&self, index: usize, s: &mut SlotInner) -> Result<(), Error> {
        let ctrl = self.link.controller();
        let params = AdvParams::connectable(index as u8, s.phy);

        let adv = ctrl.adv_create(&params, &s.payload)?;
        if let Err(status) = ctrl.adv_start(adv) {
            if ctrl.adv_delete(adv).is_err() {
                warn!("[adv] set {}: delete after failed start failed", index);
            }
            return Err(status.into());
        }

        match self
            .link
            .set_transmit_power(PowerTarget::Advertiser(adv), s.tx_power_adv)
        {
            Ok(applied) => s.tx_power_adv = applied,
            Err(e) => warn!(
                "[adv] set {}: tx power {} not applied: {:?}",
                index,
                s.tx_power_adv,
                e
            ),
        }

        s.adv = Some(adv);
        s.state = SlotState::Advertising;
        info!("[adv] set {} advertising on {:?} as {:?}", index, s.phy, adv);
        Ok(())
    }

    fn retire_advertiser(&self, index: usize, adv: AdvHandle) {
        let ctrl = self.link.controller();
        if let Err(status) = ctrl.adv_stop(adv) {
            debug!("[adv] set {}: stop {:?}", index, status);
        }
        if let Err(status) = ctrl.adv_delete(adv) {
            warn!("[adv] set {}: delete failed {:?}", index, status);
        }
    }
}
