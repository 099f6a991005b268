//! Link-quality control plane.
//!
//! The Link Control Service exposes per-link telemetry over GATT:
//!
//! 1. **Descriptor table** - one entry per characteristic (UUID and
//!    read/write/notify properties), handed to the GATT server.
//! 2. **Service** - attribute callbacks, subscription handling and the
//!    gated notification path.
//! 3. **Scheduler** - periodic RSSI sampling while someone listens.
//! 4. **Flow control** - at most one notification in flight per link and
//!    characteristic.
//! 5. **Throughput** - MTU-sized test stream over the same gates.
//!
//! On the wire every power and RSSI value is a single two's-complement
//! byte in dBm.

pub mod flow;
pub mod scheduler;
pub mod service;
pub mod throughput;

use core::sync::atomic::{AtomicBool, AtomicI8, Ordering};

use crate::config;
use crate::error::Error;

/// Characteristics of the Link Control Service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelId {
    /// Connection transmit power of the accessing link (read/write/notify).
    ConnTxPower,
    /// RSSI we measure on the link (read/notify, polled).
    LocalRssi,
    /// Throughput test stream (notify).
    Throughput,
    /// RSSI the peer measures and reports back (read/notify).
    RemoteRssi,
}

pub const CHANNEL_COUNT: usize = 4;

impl ChannelId {
    pub const ALL: [ChannelId; CHANNEL_COUNT] = [
        ChannelId::ConnTxPower,
        ChannelId::LocalRssi,
        ChannelId::Throughput,
        ChannelId::RemoteRssi,
    ];

    pub const fn index(self) -> usize {
        match self {
            ChannelId::ConnTxPower => 0,
            ChannelId::LocalRssi => 1,
            ChannelId::Throughput => 2,
            ChannelId::RemoteRssi => 3,
        }
    }

    pub fn descriptor(self) -> &'static ChannelDescriptor {
        &DESCRIPTORS[self.index()]
    }

    pub fn from_uuid(uuid: u128) -> Option<Self> {
        DESCRIPTORS.iter().find(|d| d.uuid == uuid).map(|d| d.id)
    }
}

/// Characteristic properties supported by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Properties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// Registration entry for one characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub uuid: u128,
    pub props: Properties,
}

/// Fixed descriptor table, indexed by [`ChannelId::index`].
pub static DESCRIPTORS: [ChannelDescriptor; CHANNEL_COUNT] = [
    ChannelDescriptor {
        id: ChannelId::ConnTxPower,
        uuid: config::LCS_CONN_TX_POWER_UUID,
        props: Properties {
            read: true,
            write: true,
            notify: true,
        },
    },
    ChannelDescriptor {
        id: ChannelId::LocalRssi,
        uuid: config::LCS_LOCAL_RSSI_UUID,
        props: Properties {
            read: true,
            write: false,
            notify: true,
        },
    },
    ChannelDescriptor {
        id: ChannelId::Throughput,
        uuid: config::LCS_THROUGHPUT_UUID,
        props: Properties {
            read: false,
            write: false,
            notify: true,
        },
    },
    ChannelDescriptor {
        id: ChannelId::RemoteRssi,
        uuid: config::LCS_REMOTE_RSSI_UUID,
        props: Properties {
            read: true,
            write: false,
            notify: true,
        },
    },
];

/// Identifies one submitted notification so its completion can be
/// matched to the gate that sent it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotifyTicket {
    pub slot: u8,
    pub channel: ChannelId,
    pub seq: u16,
}

/// ATT error returned from attribute callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttError {
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    InvalidAttributeValueLength,
    UnlikelyError,
    /// Common profile error "Out of Range".
    OutOfRange,
}

impl AttError {
    pub const fn code(self) -> u8 {
        match self {
            AttError::ReadNotPermitted => 0x02,
            AttError::WriteNotPermitted => 0x03,
            AttError::InvalidOffset => 0x07,
            AttError::InvalidAttributeValueLength => 0x0D,
            AttError::UnlikelyError => 0x0E,
            AttError::OutOfRange => 0xFF,
        }
    }
}

impl From<Error> for AttError {
    fn from(e: Error) -> Self {
        match e {
            Error::ValueOutOfRange => AttError::OutOfRange,
            _ => AttError::UnlikelyError,
        }
    }
}

/// Last exposed value and subscription flag of one characteristic.
pub struct TelemetryChannel {
    value: AtomicI8,
    notify_enabled: AtomicBool,
}

impl TelemetryChannel {
    pub const fn new() -> Self {
        Self {
            value: AtomicI8::new(0),
            notify_enabled: AtomicBool::new(false),
        }
    }

    pub fn value(&self) -> i8 {
        self.value.load(Ordering::Acquire)
    }

    pub(crate) fn set_value(&self, value: i8) {
        self.value.store(value, Ordering::Release);
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled.load(Ordering::Acquire)
    }

    /// Returns the previous setting.
    pub(crate) fn set_notify_enabled(&self, enabled: bool) -> bool {
        self.notify_enabled.swap(enabled, Ordering::AcqRel)
    }
}

impl Default for TelemetryChannel {
    fn default() -> Self {
        Self::new()
    }
}
