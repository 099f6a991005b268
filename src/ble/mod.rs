//! Bluetooth Low Energy link management.
//!
//! The device runs both GAP roles at once. This module owns the
//! peripheral side:
//!
//! 1. **Controller** - the trait boundary to the link layer / host stack
//!    (vendor commands, advertising sets, notifications).
//! 2. **Link Control Facade** - thin, stateless wrapper that turns
//!    controller status codes into [`Error`](crate::error::Error)s.
//! 3. **Pair Pool** - fixed array of connection/advertising pairs, one
//!    per concurrent peripheral link, each with its own PHY.
//!
//! Link-layer events reach the pool as [`LinkEvent`] values.

pub mod controller;
pub mod facade;
pub mod pool;

/// Connection handle assigned by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnHandle(pub u16);

/// Advertising set handle assigned by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdvHandle(pub u8);

/// Physical-layer profile used by a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PhyMode {
    /// LE 1M: short range, higher throughput.
    FastShortRange,
    /// LE Coded (S=8): long range, robust, slow.
    LongRangeRobust,
}

/// PHY requested for a live connection.
///
/// Wider than [`PhyMode`]: a link may move to LE 2M even though no slot
/// advertises on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkPhy {
    Le1M,
    Le2M,
    Coded,
}

impl From<PhyMode> for LinkPhy {
    fn from(mode: PhyMode) -> Self {
        match mode {
            PhyMode::FastShortRange => LinkPhy::Le1M,
            PhyMode::LongRangeRobust => LinkPhy::Coded,
        }
    }
}

/// GAP role of a link from our side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Central,
    Peripheral,
}

/// What a transmit power level is applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerTarget {
    Advertiser(AdvHandle),
    Connection(ConnHandle),
}

/// Link-layer events the pool consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    /// A link came up (or failed to, when `status != 0`).
    Connected {
        conn: ConnHandle,
        role: Role,
        status: u8,
    },
    /// A link went down.
    Disconnected { conn: ConnHandle, reason: u8 },
    /// An advertising set was connected to by a central.
    AdvertiserConnected { adv: AdvHandle, conn: ConnHandle },
}
