//! Recording [`Controller`] for unit tests.
//!
//! Every call is logged in order. Failures can be injected per operation
//! and stay in effect until cleared.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::ble::controller::{nearest_supported_tx_power, AdvParams, Controller, HciStatus};
use crate::ble::{AdvHandle, ConnHandle, LinkPhy, PowerTarget};
use crate::telemetry::{ChannelId, NotifyTicket};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    SetTxPower(PowerTarget, i8),
    ReadRssi(ConnHandle),
    SetPhy(ConnHandle, LinkPhy),
    ConnUpdate(ConnHandle, u32, u16, u16),
    AdvCreate(AdvParams, Vec<u8>),
    AdvStart(AdvHandle),
    AdvStop(AdvHandle),
    AdvDelete(AdvHandle),
    Release(ConnHandle),
    Notify(ConnHandle, ChannelId, Vec<u8>, NotifyTicket),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    next_adv: u8,
    quantize: bool,
    rssi: HashMap<u16, i8>,
    rssi_errors: HashMap<u16, HciStatus>,
    tx_power_error: Option<HciStatus>,
    adv_create_error: Option<HciStatus>,
    adv_start_error: Option<HciStatus>,
    notify_error: Option<HciStatus>,
}

#[derive(Default)]
pub struct MockController {
    state: RefCell<State>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller that snaps power levels to the radio's table.
    pub fn quantizing() -> Self {
        let mock = Self::default();
        mock.state.borrow_mut().quantize = true;
        mock
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn notifications(&self) -> Vec<(ConnHandle, ChannelId, Vec<u8>, NotifyTicket)> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Notify(conn, ch, value, ticket) => Some((*conn, *ch, value.clone(), *ticket)),
                _ => None,
            })
            .collect()
    }

    pub fn set_rssi(&self, conn: ConnHandle, rssi: i8) {
        self.state.borrow_mut().rssi.insert(conn.0, rssi);
    }

    pub fn fail_rssi(&self, conn: ConnHandle, status: HciStatus) {
        self.state.borrow_mut().rssi_errors.insert(conn.0, status);
    }

    pub fn fail_tx_power(&self, status: Option<HciStatus>) {
        self.state.borrow_mut().tx_power_error = status;
    }

    pub fn fail_adv_create(&self, status: Option<HciStatus>) {
        self.state.borrow_mut().adv_create_error = status;
    }

    pub fn fail_adv_start(&self, status: Option<HciStatus>) {
        self.state.borrow_mut().adv_start_error = status;
    }

    pub fn fail_notify(&self, status: Option<HciStatus>) {
        self.state.borrow_mut().notify_error = status;
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Controller for MockController {
    fn set_tx_power(&self, target: PowerTarget, level: i8) -> Result<i8, HciStatus> {
        self.record(Call::SetTxPower(target, level));
        let state = self.state.borrow();
        if let Some(status) = state.tx_power_error {
            return Err(status);
        }
        Ok(if state.quantize {
            nearest_supported_tx_power(level)
        } else {
            level
        })
    }

    fn read_rssi(&self, conn: ConnHandle) -> Result<i8, HciStatus> {
        self.record(Call::ReadRssi(conn));
        let state = self.state.borrow();
        if let Some(status) = state.rssi_errors.get(&conn.0) {
            return Err(*status);
        }
        state
            .rssi
            .get(&conn.0)
            .copied()
            .ok_or(HciStatus::UNKNOWN_CONNECTION_ID)
    }

    fn set_phy(&self, conn: ConnHandle, phy: LinkPhy) -> Result<(), HciStatus> {
        self.record(Call::SetPhy(conn, phy));
        Ok(())
    }

    fn conn_update(
        &self,
        conn: ConnHandle,
        interval_us: u32,
        latency: u16,
        supervision_timeout: u16,
    ) -> Result<(), HciStatus> {
        self.record(Call::ConnUpdate(conn, interval_us, latency, supervision_timeout));
        Ok(())
    }

    fn adv_create(&self, params: &AdvParams, data: &[u8]) -> Result<AdvHandle, HciStatus> {
        self.record(Call::AdvCreate(*params, data.to_vec()));
        let mut state = self.state.borrow_mut();
        if let Some(status) = state.adv_create_error {
            return Err(status);
        }
        let handle = AdvHandle(state.next_adv);
        state.next_adv = state.next_adv.wrapping_add(1);
        Ok(handle)
    }

    fn adv_start(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        self.record(Call::AdvStart(adv));
        match self.state.borrow().adv_start_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn adv_stop(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        self.record(Call::AdvStop(adv));
        Ok(())
    }

    fn adv_delete(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        self.record(Call::AdvDelete(adv));
        Ok(())
    }

    fn release_connection(&self, conn: ConnHandle) {
        self.record(Call::Release(conn));
    }

    fn notify(
        &self,
        conn: ConnHandle,
        channel: ChannelId,
        value: &[u8],
        ticket: NotifyTicket,
    ) -> Result<(), HciStatus> {
        self.record(Call::Notify(conn, channel, value.to_vec(), ticket));
        match self.state.borrow().notify_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}
