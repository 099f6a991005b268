//! Unified error type for linkpool.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (feature `defmt`) for on-target logging.

use crate::ble::controller::HciStatus;

/// Top-level error type used across the pool, facade and control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Pool
    /// Every slot in the pool is already in use.
    PoolExhausted,

    /// The slot index is outside the pool.
    NoSuchSlot,

    /// The slot is not in a state that allows the requested transition.
    InvalidState,

    /// An event referenced a connection or advertiser the pool does not own.
    InconsistentEvent,

    /// The advertising payload does not fit in a slot.
    PayloadTooLarge,

    // Controller
    /// The connection or advertiser handle is no longer valid.
    HandleStale,

    /// The controller does not support the operation in the current link state.
    NotSupported,

    /// The controller rejected a command with the given HCI status code.
    TransportRejected(u8),

    // Generic
    /// A value is outside the accepted range.
    ValueOutOfRange,

    /// Operation timed out.
    Timeout,
}

// Convenience conversions

impl From<HciStatus> for Error {
    fn from(status: HciStatus) -> Self {
        match status {
            HciStatus::UNKNOWN_CONNECTION_ID | HciStatus::UNKNOWN_ADVERTISING_ID => {
                Error::HandleStale
            }
            HciStatus::COMMAND_DISALLOWED | HciStatus::UNSUPPORTED_FEATURE => {
                Error::NotSupported
            }
            HciStatus(code) => Error::TransportRejected(code),
        }
    }
}

impl From<embassy_time::TimeoutError> for Error {
    fn from(_: embassy_time::TimeoutError) -> Self {
        Error::Timeout
    }
}
