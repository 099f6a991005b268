//! Scripted radio shared by the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use linkpool::ble::controller::{nearest_supported_tx_power, AdvParams, Controller, HciStatus};
use linkpool::ble::{AdvHandle, ConnHandle, LinkPhy, PhyMode, PowerTarget};
use linkpool::telemetry::{ChannelId, NotifyTicket};
use linkpool::{LinkControl, PairPool, TelemetryService};

pub type M = CriticalSectionRawMutex;
pub type Pool<'a> = PairPool<'a, M, FakeRadio, 2>;
pub type Service<'a> = TelemetryService<'a, M, FakeRadio, 2>;

pub const ADV_PAYLOAD: &[u8] = &[0x02, 0x01, 0x06, 0x04, 0x09, b'L', b'C', b'S'];

/// A notification the radio accepted.
#[derive(Clone, Debug)]
pub struct Sent {
    pub conn: ConnHandle,
    pub channel: ChannelId,
    pub value: Vec<u8>,
    pub ticket: NotifyTicket,
}

/// Controller with live advertising sets, a power table and per-link RSSI.
#[derive(Default)]
pub struct FakeRadio {
    next_adv: Cell<u8>,
    live_sets: RefCell<HashMap<u8, PhyMode>>,
    running: RefCell<Vec<AdvHandle>>,
    rssi: RefCell<HashMap<u16, i8>>,
    rssi_reads: Cell<usize>,
    phy_requests: RefCell<Vec<(ConnHandle, LinkPhy)>>,
    intervals: RefCell<Vec<(ConnHandle, u32)>>,
    released: RefCell<Vec<ConnHandle>>,
    sent: RefCell<Vec<Sent>>,
}

impl FakeRadio {
    pub fn is_running(&self, adv: AdvHandle) -> bool {
        self.running.borrow().contains(&adv)
    }

    pub fn live_sets(&self) -> usize {
        self.live_sets.borrow().len()
    }

    pub fn set_rssi(&self, conn: ConnHandle, rssi: i8) {
        self.rssi.borrow_mut().insert(conn.0, rssi);
    }

    pub fn rssi_reads(&self) -> usize {
        self.rssi_reads.get()
    }

    pub fn phy_requests(&self) -> Vec<(ConnHandle, LinkPhy)> {
        self.phy_requests.borrow().clone()
    }

    pub fn intervals(&self) -> Vec<(ConnHandle, u32)> {
        self.intervals.borrow().clone()
    }

    pub fn released(&self) -> Vec<ConnHandle> {
        self.released.borrow().clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.borrow().clone()
    }

    pub fn sent_on(&self, channel: ChannelId) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.channel == channel).collect()
    }
}

impl Controller for FakeRadio {
    fn set_tx_power(&self, _target: PowerTarget, level: i8) -> Result<i8, HciStatus> {
        Ok(nearest_supported_tx_power(level))
    }

    fn read_rssi(&self, conn: ConnHandle) -> Result<i8, HciStatus> {
        self.rssi_reads.set(self.rssi_reads.get() + 1);
        self.rssi
            .borrow()
            .get(&conn.0)
            .copied()
            .ok_or(HciStatus::UNKNOWN_CONNECTION_ID)
    }

    fn set_phy(&self, conn: ConnHandle, phy: LinkPhy) -> Result<(), HciStatus> {
        self.phy_requests.borrow_mut().push((conn, phy));
        Ok(())
    }

    fn conn_update(
        &self,
        conn: ConnHandle,
        interval_us: u32,
        _latency: u16,
        _supervision_timeout: u16,
    ) -> Result<(), HciStatus> {
        self.intervals.borrow_mut().push((conn, interval_us));
        Ok(())
    }

    fn adv_create(&self, params: &AdvParams, _data: &[u8]) -> Result<AdvHandle, HciStatus> {
        let handle = self.next_adv.get();
        self.next_adv.set(handle.wrapping_add(1));
        self.live_sets.borrow_mut().insert(handle, params.phy);
        Ok(AdvHandle(handle))
    }

    fn adv_start(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        if !self.live_sets.borrow().contains_key(&adv.0) {
            return Err(HciStatus::UNKNOWN_ADVERTISING_ID);
        }
        self.running.borrow_mut().push(adv);
        Ok(())
    }

    fn adv_stop(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        self.running.borrow_mut().retain(|&a| a != adv);
        Ok(())
    }

    fn adv_delete(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        self.running.borrow_mut().retain(|&a| a != adv);
        self.live_sets
            .borrow_mut()
            .remove(&adv.0)
            .map(|_| ())
            .ok_or(HciStatus::UNKNOWN_ADVERTISING_ID)
    }

    fn release_connection(&self, conn: ConnHandle) {
        self.rssi.borrow_mut().remove(&conn.0);
        self.released.borrow_mut().push(conn);
    }

    fn notify(
        &self,
        conn: ConnHandle,
        channel: ChannelId,
        value: &[u8],
        ticket: NotifyTicket,
    ) -> Result<(), HciStatus> {
        self.sent.borrow_mut().push(Sent {
            conn,
            channel,
            value: value.to_vec(),
            ticket,
        });
        Ok(())
    }
}

pub fn radio() -> LinkControl<FakeRadio> {
    LinkControl::new(FakeRadio::default())
}

/// Allocate the standard two slots: LE 1M first, then LE Coded.
pub fn allocate_both(pool: &Pool<'_>) {
    assert_eq!(pool.allocate(PhyMode::FastShortRange, 0, 0, ADV_PAYLOAD), Ok(0));
    assert_eq!(pool.allocate(PhyMode::LongRangeRobust, 0, 0, ADV_PAYLOAD), Ok(1));
}

pub fn adv_of(pool: &Pool<'_>, slot: usize) -> AdvHandle {
    pool.snapshot(slot)
        .and_then(|s| s.adv)
        .expect("slot is not advertising")
}
