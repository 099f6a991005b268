//! linkpool firmware for nRF52840 + S140.
//!
//! One advertiser task per pool slot takes turns on the radio (S140 has a
//! single advertising set). A connected slot's task serves GATT for that
//! link until it drops. Link events go through one channel to the pool so
//! transitions happen in order.

#![no_std]
#![no_main]

mod board;

use defmt::{info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::interrupt::Priority;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration, Timer};
use heapless::Vec;
use nrf_softdevice::ble::{gatt_server, peripheral};
use nrf_softdevice::{self as sd, Softdevice};
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use linkpool::ble::{LinkEvent, PhyMode, Role};
use linkpool::config;
use linkpool::telemetry::throughput::ThroughputStream;
use linkpool::{LinkControl, PairPool, TelemetryService};

use board::gatt::Server;
use board::softdevice::{CompletionChannel, EventChannel, SoftdeviceController};

type Pool = PairPool<'static, CriticalSectionRawMutex, SoftdeviceController, { config::POOL_CAPACITY }>;
pub type Service =
    TelemetryService<'static, CriticalSectionRawMutex, SoftdeviceController, { config::POOL_CAPACITY }>;

/// PHY of each slot, by index.
const SLOT_PHYS: [PhyMode; config::POOL_CAPACITY] =
    [PhyMode::FastShortRange, PhyMode::LongRangeRobust];

/// `gatt_server::run` ends with a bare `DisconnectedError`; the HCI
/// reason never reaches us.
const DISCONNECT_REASON_UNKNOWN: u8 = 0xFF;

static EVENTS: EventChannel = Channel::new();
static COMPLETIONS: CompletionChannel = Channel::new();
static RADIO: Mutex<CriticalSectionRawMutex, ()> = Mutex::new(());
static STREAM: ThroughputStream = ThroughputStream::new();

static SERVER: StaticCell<Server> = StaticCell::new();
static LINK: StaticCell<LinkControl<SoftdeviceController>> = StaticCell::new();
static POOL: StaticCell<Pool> = StaticCell::new();
static SERVICE: StaticCell<Service> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("linkpool starting");

    // The SoftDevice reserves priorities 0, 1 and 4.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = Priority::P2;
    nrf_config.time_interrupt_priority = Priority::P2;
    let _p = embassy_nrf::init(nrf_config);

    let sd = Softdevice::enable(&softdevice_config());
    let server: &'static Server = SERVER.init(unwrap!(Server::new(sd)));
    let sd: &'static Softdevice = sd;
    spawner.must_spawn(softdevice_task(sd));

    let link: &'static LinkControl<SoftdeviceController> =
        LINK.init(LinkControl::new(SoftdeviceController::new(server, &COMPLETIONS)));
    let pool: &'static Pool = POOL.init(PairPool::new(link));
    let service: &'static Service = SERVICE.init(TelemetryService::new(pool));

    let payload = advertisement();
    for (slot, phy) in SLOT_PHYS.into_iter().enumerate() {
        let allocated = pool.allocate(
            phy,
            config::DEFAULT_CONN_TX_POWER_DBM,
            config::DEFAULT_ADV_TX_POWER_DBM,
            &payload,
        );
        if let Err(e) = allocated {
            warn!("[pool] slot {} not started: {:?}", slot, e);
        }
    }

    for sid in 0..config::POOL_CAPACITY {
        spawner.must_spawn(advertiser_task(sid, sd, server, service));
    }
    spawner.must_spawn(link_event_task(service));
    spawner.must_spawn(completion_task(service));
    spawner.must_spawn(rssi_task(service));
    spawner.must_spawn(throughput_task(service));
    spawner.must_spawn(attribute_sync_task(server, service));
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

/// Advertise slot `sid`'s set in turns of `ADV_TIME_SLICE_MS`, then serve
/// the link a central opens on it.
#[embassy_executor::task(pool_size = config::POOL_CAPACITY)]
async fn advertiser_task(
    sid: usize,
    sd: &'static Softdevice,
    server: &'static Server,
    service: &'static Service,
) -> ! {
    let board = service.link().controller();

    loop {
        let Some(set) = board.running_set(sid) else {
            board.adv_changed(sid).await;
            continue;
        };

        let radio = RADIO.lock().await;
        let adv = peripheral::ConnectableAdvertisement::ExtendedNonscannableUndirected {
            set_id: set.params.sid,
            anonymous: false,
            adv_data: &set.data,
        };
        let adv_config = peripheral::Config {
            primary_phy: set.phy(),
            secondary_phy: set.phy(),
            tx_power: set.tx_power(),
            interval: set.params.interval_min,
            ..Default::default()
        };
        let turn = with_timeout(
            Duration::from_millis(config::ADV_TIME_SLICE_MS),
            select(
                peripheral::advertise_connectable(sd, adv, &adv_config),
                board.adv_changed(sid),
            ),
        )
        .await;
        drop(radio);

        let conn = match turn {
            Ok(Either::First(Ok(conn))) => conn,
            Ok(Either::First(Err(e))) => {
                warn!("[adv] set {} failed: {:?}", sid, e);
                Timer::after_millis(250).await;
                continue;
            }
            // Set reconfigured, or our turn is over.
            Ok(Either::Second(())) | Err(_) => {
                embassy_futures::yield_now().await;
                continue;
            }
        };

        let Some(handle) = board.attach(&conn) else {
            continue;
        };
        EVENTS
            .send(LinkEvent::Connected {
                conn: handle,
                role: Role::Peripheral,
                status: 0,
            })
            .await;
        EVENTS
            .send(LinkEvent::AdvertiserConnected {
                adv: set.handle,
                conn: handle,
            })
            .await;

        let closed = gatt_server::run(&conn, server, |e| server.handle(service, &conn, e)).await;
        info!("[pool] link {} closed: {:?}", handle, closed);

        EVENTS
            .send(LinkEvent::Disconnected {
                conn: handle,
                reason: DISCONNECT_REASON_UNKNOWN,
            })
            .await;
    }
}

#[embassy_executor::task]
async fn link_event_task(service: &'static Service) -> ! {
    loop {
        let event = EVENTS.receive().await;
        if let Err(e) = service.dispatch(event).await {
            warn!("[pool] {:?} not applied: {:?}", event, e);
        }
    }
}

#[embassy_executor::task]
async fn completion_task(service: &'static Service) -> ! {
    loop {
        let ticket = COMPLETIONS.receive().await;
        service.on_notification_complete(ticket);
    }
}

#[embassy_executor::task]
async fn rssi_task(service: &'static Service) -> ! {
    service.run_rssi_polling().await
}

#[embassy_executor::task]
async fn throughput_task(service: &'static Service) -> ! {
    STREAM.run(service).await
}

#[embassy_executor::task]
async fn attribute_sync_task(server: &'static Server, service: &'static Service) -> ! {
    loop {
        Timer::after_millis(config::RSSI_POLL_INTERVAL_MS).await;
        server.sync(service);
    }
}

/// Flags plus complete local name; shared by every slot.
fn advertisement() -> Vec<u8, { config::ADV_DATA_MAX_LEN }> {
    let name = config::DEVICE_NAME.as_bytes();
    let mut data = Vec::new();
    let _ = data.extend_from_slice(&[
        0x02,
        0x01,
        sd::raw::BLE_GAP_ADV_FLAGS_LE_ONLY_GENERAL_DISC_MODE as u8,
        name.len() as u8 + 1,
        0x09,
    ]);
    let _ = data.extend_from_slice(name);
    data
}

fn softdevice_config() -> sd::Config {
    let name_len = config::DEVICE_NAME.len() as u16;
    sd::Config {
        clock: Some(sd::raw::nrf_clock_lf_cfg_t {
            source: sd::raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: sd::raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(sd::raw::ble_gap_conn_cfg_t {
            conn_count: config::POOL_CAPACITY as u8,
            event_length: 24,
        }),
        conn_gatt: Some(sd::raw::ble_gatt_conn_cfg_t {
            att_mtu: config::ATT_MTU as u16,
        }),
        conn_gatts: Some(sd::raw::ble_gatts_conn_cfg_t {
            hvn_tx_queue_size: 4,
        }),
        gatts_attr_tab_size: Some(sd::raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: sd::raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(sd::raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: config::POOL_CAPACITY as u8,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: sd::raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(sd::raw::ble_gap_cfg_device_name_t {
            p_value: config::DEVICE_NAME.as_ptr() as _,
            current_len: name_len,
            max_len: name_len,
            write_perm: unsafe { core::mem::zeroed() },
            _bitfield_1: sd::raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                sd::raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    }
}
