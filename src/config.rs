//! Application-wide constants and compile-time configuration.
//!
//! Pool sizing, timing parameters, radio settings and protocol
//! identifiers live here so they can be tuned in one place.

// Pool

/// Number of connection/advertising pairs. Must not exceed the number of
/// concurrent peripheral links the controller is configured for.
pub const POOL_CAPACITY: usize = 2;

/// Bounded wait for the disconnect → re-advertise handoff (ms).
pub const HANDOFF_TIMEOUT_MS: u64 = 50;

// Advertising

/// Advertising interval range (in 0.625 ms units).
/// 0xA0 = 100 ms, 0xF0 = 150 ms.
pub const ADV_INTERVAL_MIN: u32 = 0x00A0;
pub const ADV_INTERVAL_MAX: u32 = 0x00F0;

/// Largest advertising payload a slot stores for re-advertising.
pub const ADV_DATA_MAX_LEN: usize = 31;

/// Complete local name placed in the default advertising payload.
pub const DEVICE_NAME: &str = "LinkCtl";

/// S140 can only run one advertising set; slots hand the radio over
/// after this long (ms) so every PHY gets airtime.
pub const ADV_TIME_SLICE_MS: u64 = 1_000;

// Transmit power

/// Accepted range for power values on the control plane (dBm).
pub const TX_POWER_MIN_DBM: i8 = -127;
pub const TX_POWER_MAX_DBM: i8 = 20;

/// Power applied when a slot is allocated without an explicit level.
pub const DEFAULT_CONN_TX_POWER_DBM: i8 = 0;
pub const DEFAULT_ADV_TX_POWER_DBM: i8 = 0;

/// Output levels the nRF52840 radio supports (dBm), ascending.
pub const SUPPORTED_TX_POWER_DBM: [i8; 14] = [-40, -20, -16, -12, -8, -4, 0, 2, 3, 4, 5, 6, 7, 8];

// Connection parameters

/// Slave latency (number of connection events the peripheral can skip).
pub const CONN_SLAVE_LATENCY: u16 = 0;

/// Supervision timeout (in 10 ms units). 300 = 3 s.
pub const CONN_SUP_TIMEOUT: u16 = 300;

/// Connection interval bounds accepted by `set_interval` (µs).
pub const CONN_INTERVAL_MIN_US: u32 = 7_500;
pub const CONN_INTERVAL_MAX_US: u32 = 4_000_000;

// Telemetry

/// RSSI polling period while a subscriber is listening (ms).
pub const RSSI_POLL_INTERVAL_MS: u64 = 500;

/// Negotiated ATT MTU the throughput payload is sized for.
pub const ATT_MTU: usize = 247;

/// Throughput notification payload (MTU minus the 3-byte ATT header).
pub const THROUGHPUT_PAYLOAD_LEN: usize = ATT_MTU - 3;

/// How often the throughput stream re-checks for a subscriber (ms).
pub const THROUGHPUT_IDLE_POLL_MS: u64 = 250;

/// Bounded wait for a notification gate before a payload is dropped (ms).
pub const NOTIFY_ACQUIRE_TIMEOUT_MS: u64 = 100;

// Link Control Service UUIDs (430EBADx-5C25-469E-A162-A1C9DC50A8FD)

pub const LCS_SERVICE_UUID: u128 = 0x430e_bad0_5c25_469e_a162_a1c9_dc50_a8fd;
pub const LCS_CONN_TX_POWER_UUID: u128 = 0x430e_bad1_5c25_469e_a162_a1c9_dc50_a8fd;
pub const LCS_LOCAL_RSSI_UUID: u128 = 0x430e_bad2_5c25_469e_a162_a1c9_dc50_a8fd;
pub const LCS_THROUGHPUT_UUID: u128 = 0x430e_bad3_5c25_469e_a162_a1c9_dc50_a8fd;
pub const LCS_REMOTE_RSSI_UUID: u128 = 0x430e_bad4_5c25_469e_a162_a1c9_dc50_a8fd;
