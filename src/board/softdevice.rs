//! [`Controller`] over the S140 SoftDevice.
//!
//! S140 runs a single advertising set at a time. Advertising sets created
//! by the pool are therefore kept in a table here, and one advertiser
//! task per slot takes turns on the radio (see `main.rs`). A set's power
//! is applied when its next turn starts.
//!
//! Connection handles map to [`Connection`] objects held until the pool
//! releases them.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, Ordering};

use defmt::{debug, warn};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::{self, NotifyValueError};
use nrf_softdevice::ble::{Connection, Phy, SetConnParamsError, TxPower};
use nrf_softdevice::raw;

use linkpool::ble::controller::{nearest_supported_tx_power, AdvParams, Controller, HciStatus};
use linkpool::ble::{AdvHandle, ConnHandle, LinkEvent, LinkPhy, PhyMode, PowerTarget};
use linkpool::config;
use linkpool::telemetry::{ChannelId, NotifyTicket, CHANNEL_COUNT};

use super::gatt::Server;

type M = CriticalSectionRawMutex;

const N: usize = config::POOL_CAPACITY;

/// Status for SoftDevice errors with no HCI equivalent.
const UNSPECIFIED_ERROR: HciStatus = HciStatus(0x1F);

pub type EventChannel = Channel<M, LinkEvent, 8>;

/// At most one notification per gate is in flight, so this never fills.
pub type CompletionChannel = Channel<M, NotifyTicket, { N * CHANNEL_COUNT }>;

/// One advertising set as last configured by the pool.
#[derive(Clone)]
pub struct AdvSet {
    pub handle: AdvHandle,
    pub params: AdvParams,
    pub data: Vec<u8, { config::ADV_DATA_MAX_LEN }>,
    pub tx_power: i8,
    running: bool,
}

impl AdvSet {
    pub fn phy(&self) -> Phy {
        phy(self.params.phy)
    }

    pub fn tx_power(&self) -> TxPower {
        tx_power(self.tx_power)
    }
}

pub struct SoftdeviceController {
    server: &'static Server,
    completions: &'static CompletionChannel,
    sets: Mutex<M, RefCell<[Option<AdvSet>; N]>>,
    links: Mutex<M, RefCell<[Option<Connection>; N]>>,
    adv_changed: [Signal<M, ()>; N],
    next_adv: AtomicU8,
}

impl SoftdeviceController {
    pub fn new(server: &'static Server, completions: &'static CompletionChannel) -> Self {
        Self {
            server,
            completions,
            sets: Mutex::new(RefCell::new([const { None }; N])),
            links: Mutex::new(RefCell::new([const { None }; N])),
            adv_changed: [const { Signal::new() }; N],
            next_adv: AtomicU8::new(0),
        }
    }

    /// The set of slot `sid` if the pool wants it on air.
    pub fn running_set(&self, sid: usize) -> Option<AdvSet> {
        self.sets
            .lock(|sets| sets.borrow().get(sid).cloned().flatten())
            .filter(|set| set.running)
    }

    /// Resolves when slot `sid`'s set is started, stopped or deleted.
    pub async fn adv_changed(&self, sid: usize) {
        match self.adv_changed.get(sid) {
            Some(signal) => signal.wait().await,
            None => core::future::pending().await,
        }
    }

    /// Take a reference to a new peripheral link.
    pub fn attach(&self, conn: &Connection) -> Option<ConnHandle> {
        let handle = conn.handle()?;
        // Report every sample, no threshold.
        if let Err(status) = check(unsafe { raw::sd_ble_gap_rssi_start(handle, 0, 0) }) {
            debug!("[rssi] start on {} failed: {:#x}", handle, status.0);
        }
        let stored = self.links.lock(|links| {
            let mut links = links.borrow_mut();
            match links.iter_mut().find(|l| l.is_none()) {
                Some(free) => {
                    *free = Some(conn.clone());
                    true
                }
                None => false,
            }
        });
        if !stored {
            warn!("[pool] no room to track link {}", handle);
        }
        Some(ConnHandle(handle))
    }

    fn connection(&self, conn: ConnHandle) -> Result<Connection, HciStatus> {
        self.links
            .lock(|links| {
                links
                    .borrow()
                    .iter()
                    .flatten()
                    .find(|c| c.handle() == Some(conn.0))
                    .cloned()
            })
            .ok_or(HciStatus::UNKNOWN_CONNECTION_ID)
    }

    fn with_set<R>(
        &self,
        adv: AdvHandle,
        f: impl FnOnce(&mut Option<AdvSet>) -> R,
    ) -> Result<(usize, R), HciStatus> {
        self.sets.lock(|sets| {
            let mut sets = sets.borrow_mut();
            let sid = sets
                .iter()
                .position(|s| s.as_ref().map(|s| s.handle) == Some(adv))
                .ok_or(HciStatus::UNKNOWN_ADVERTISING_ID)?;
            Ok((sid, f(&mut sets[sid])))
        })
    }

    fn set_changed(&self, sid: usize) {
        if let Some(signal) = self.adv_changed.get(sid) {
            signal.signal(());
        }
    }
}

impl Controller for SoftdeviceController {
    fn set_tx_power(&self, target: PowerTarget, level: i8) -> Result<i8, HciStatus> {
        let level = nearest_supported_tx_power(level);
        match target {
            PowerTarget::Advertiser(adv) => {
                self.with_set(adv, |set| {
                    if let Some(set) = set {
                        set.tx_power = level;
                    }
                })?;
                Ok(level)
            }
            PowerTarget::Connection(conn) => {
                let role = raw::BLE_GAP_TX_POWER_ROLES_BLE_GAP_TX_POWER_ROLE_CONN as u8;
                check(unsafe { raw::sd_ble_gap_tx_power_set(role, conn.0, level) })?;
                Ok(level)
            }
        }
    }

    fn read_rssi(&self, conn: ConnHandle) -> Result<i8, HciStatus> {
        let mut rssi: i8 = 0;
        let mut channel: u8 = 0;
        check(unsafe { raw::sd_ble_gap_rssi_get(conn.0, &mut rssi, &mut channel) })?;
        Ok(rssi)
    }

    fn set_phy(&self, conn: ConnHandle, phy: LinkPhy) -> Result<(), HciStatus> {
        let bits = match phy {
            LinkPhy::Le1M => raw::BLE_GAP_PHY_1MBPS,
            LinkPhy::Le2M => raw::BLE_GAP_PHY_2MBPS,
            LinkPhy::Coded => raw::BLE_GAP_PHY_CODED,
        } as u8;
        let phys = raw::ble_gap_phys_t {
            tx_phys: bits,
            rx_phys: bits,
        };
        check(unsafe { raw::sd_ble_gap_phy_update(conn.0, &phys) })
    }

    fn conn_update(
        &self,
        conn: ConnHandle,
        interval_us: u32,
        latency: u16,
        supervision_timeout: u16,
    ) -> Result<(), HciStatus> {
        // 1.25 ms units.
        let interval = (interval_us / 1250) as u16;
        let params = raw::ble_gap_conn_params_t {
            min_conn_interval: interval,
            max_conn_interval: interval,
            slave_latency: latency,
            conn_sup_timeout: supervision_timeout,
        };
        match self.connection(conn)?.set_conn_params(params) {
            Ok(()) => Ok(()),
            Err(SetConnParamsError::Disconnected) => Err(HciStatus::UNKNOWN_CONNECTION_ID),
            Err(SetConnParamsError::Raw(e)) => Err(raw_status(e as u32)),
        }
    }

    fn adv_create(&self, params: &AdvParams, data: &[u8]) -> Result<AdvHandle, HciStatus> {
        let data = Vec::from_slice(data).map_err(|_| HciStatus::INVALID_PARAMETERS)?;
        let handle = AdvHandle(self.next_adv.fetch_add(1, Ordering::Relaxed));
        let sid = usize::from(params.sid);

        self.sets.lock(|sets| {
            let mut sets = sets.borrow_mut();
            let entry = sets.get_mut(sid).ok_or(HciStatus::INVALID_PARAMETERS)?;
            if entry.is_some() {
                return Err(HciStatus::LIMIT_REACHED);
            }
            *entry = Some(AdvSet {
                handle,
                params: *params,
                data,
                tx_power: config::DEFAULT_ADV_TX_POWER_DBM,
                running: false,
            });
            Ok(handle)
        })
    }

    fn adv_start(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        let (sid, ()) = self.with_set(adv, |set| {
            if let Some(set) = set {
                set.running = true;
            }
        })?;
        self.set_changed(sid);
        Ok(())
    }

    fn adv_stop(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        let (sid, ()) = self.with_set(adv, |set| {
            if let Some(set) = set {
                set.running = false;
            }
        })?;
        self.set_changed(sid);
        Ok(())
    }

    fn adv_delete(&self, adv: AdvHandle) -> Result<(), HciStatus> {
        let (sid, ()) = self.with_set(adv, |set| *set = None)?;
        self.set_changed(sid);
        Ok(())
    }

    fn release_connection(&self, conn: ConnHandle) {
        self.links.lock(|links| {
            for link in links.borrow_mut().iter_mut() {
                if link.as_ref().and_then(Connection::handle) == Some(conn.0) {
                    *link = None;
                }
            }
        });
    }

    fn notify(
        &self,
        conn: ConnHandle,
        channel: ChannelId,
        value: &[u8],
        ticket: NotifyTicket,
    ) -> Result<(), HciStatus> {
        let link = self.connection(conn)?;
        match gatt_server::notify_value(&link, self.server.value_handle(channel), value) {
            Ok(()) => {
                // Queued in the SoftDevice's HVN TX queue; that is as far as
                // completion is reported to us.
                if self.completions.try_send(ticket).is_err() {
                    warn!("[flow] completion queue full");
                }
                Ok(())
            }
            Err(NotifyValueError::Disconnected) => Err(HciStatus::UNKNOWN_CONNECTION_ID),
            Err(NotifyValueError::Raw(e)) => Err(raw_status(e as u32)),
        }
    }
}

fn check(ret: u32) -> Result<(), HciStatus> {
    if ret == raw::NRF_SUCCESS {
        Ok(())
    } else {
        Err(raw_status(ret))
    }
}

fn raw_status(ret: u32) -> HciStatus {
    match ret {
        raw::BLE_ERROR_INVALID_CONN_HANDLE => HciStatus::UNKNOWN_CONNECTION_ID,
        raw::BLE_ERROR_INVALID_ADV_HANDLE => HciStatus::UNKNOWN_ADVERTISING_ID,
        raw::NRF_ERROR_INVALID_STATE | raw::NRF_ERROR_BUSY => HciStatus::COMMAND_DISALLOWED,
        raw::NRF_ERROR_NOT_SUPPORTED => HciStatus::UNSUPPORTED_FEATURE,
        raw::NRF_ERROR_INVALID_PARAM => HciStatus::INVALID_PARAMETERS,
        raw::NRF_ERROR_NO_MEM | raw::NRF_ERROR_RESOURCES => HciStatus::MEMORY_CAPACITY_EXCEEDED,
        _ => UNSPECIFIED_ERROR,
    }
}

fn phy(mode: PhyMode) -> Phy {
    match mode {
        PhyMode::FastShortRange => Phy::M1,
        PhyMode::LongRangeRobust => Phy::Coded,
    }
}

/// `level` must already be one of `SUPPORTED_TX_POWER_DBM`.
fn tx_power(level: i8) -> TxPower {
    match level {
        i8::MIN..=-40 => TxPower::Minus40dBm,
        -39..=-20 => TxPower::Minus20dBm,
        -19..=-16 => TxPower::Minus16dBm,
        -15..=-12 => TxPower::Minus12dBm,
        -11..=-8 => TxPower::Minus8dBm,
        -7..=-4 => TxPower::Minus4dBm,
        -3..=0 => TxPower::ZerodBm,
        1..=2 => TxPower::Plus2dBm,
        3 => TxPower::Plus3dBm,
        4 => TxPower::Plus4dBm,
        5 => TxPower::Plus5dBm,
        6 => TxPower::Plus6dBm,
        7 => TxPower::Plus7dBm,
        _ => TxPower::Plus8dBm,
    }
}
