//! Administrative line commands.
//!
//! ```text
//! status
//! set_tx <slot> <dBm>
//! set_adv_tx <slot> <dBm>
//! set_phy <slot> <1m|2m|coded>
//! set_interval <slot> <us>
//! ```
//!
//! The shell transport is not part of this crate; it hands each line to
//! [`parse`] and the result to [`execute`] with a `core::fmt::Write` sink.

use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::ble::controller::Controller;
use crate::ble::pool::{PowerSetting, SlotState};
use crate::ble::{ConnHandle, LinkPhy};
use crate::config;
use crate::error::Error;
use crate::telemetry::service::TelemetryService;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Status,
    SetTx { slot: usize, dbm: i8 },
    SetAdvTx { slot: usize, dbm: i8 },
    SetPhy { slot: usize, phy: LinkPhy },
    SetInterval { slot: usize, interval_us: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    Empty,
    UnknownCommand,
    MissingArgument,
    UnexpectedArgument,
    InvalidNumber,
    InvalidPhy,
}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let name = words.next().ok_or(ParseError::Empty)?;

    let cmd = match name {
        "status" => Command::Status,
        "set_tx" => Command::SetTx {
            slot: number(words.next())?,
            dbm: number(words.next())?,
        },
        "set_adv_tx" => Command::SetAdvTx {
            slot: number(words.next())?,
            dbm: number(words.next())?,
        },
        "set_phy" => Command::SetPhy {
            slot: number(words.next())?,
            phy: phy(words.next())?,
        },
        "set_interval" => Command::SetInterval {
            slot: number(words.next())?,
            interval_us: number(words.next())?,
        },
        _ => return Err(ParseError::UnknownCommand),
    };

    if words.next().is_some() {
        return Err(ParseError::UnexpectedArgument);
    }
    Ok(cmd)
}

fn number<T: core::str::FromStr>(word: Option<&str>) -> Result<T, ParseError> {
    word.ok_or(ParseError::MissingArgument)?
        .parse()
        .map_err(|_| ParseError::InvalidNumber)
}

fn phy(word: Option<&str>) -> Result<LinkPhy, ParseError> {
    match word.ok_or(ParseError::MissingArgument)? {
        "1m" => Ok(LinkPhy::Le1M),
        "2m" => Ok(LinkPhy::Le2M),
        "coded" => Ok(LinkPhy::Coded),
        _ => Err(ParseError::InvalidPhy),
    }
}

/// Run a parsed command, writing a short report to `out`.
///
/// Errors are returned as-is; nothing is written for a failed command.
pub fn execute<M: RawMutex, C: Controller, const N: usize>(
    cmd: Command,
    service: &TelemetryService<'_, M, C, N>,
    out: &mut impl Write,
) -> Result<(), Error> {
    let pool = service.pool();

    match cmd {
        Command::Status => {
            for s in pool.snapshots() {
                let _ = write!(
                    out,
                    "slot {}: {:?} {:?} conn_tx={} adv_tx={}",
                    s.index, s.state, s.phy, s.tx_power_conn, s.tx_power_adv
                );
                if let Some(conn) = s.conn {
                    let _ = write!(out, " conn={}", conn.0);
                }
                if let Some(rssi) = s.last_rssi {
                    let _ = write!(out, " rssi={}", rssi);
                }
                let _ = writeln!(out);
            }
        }
        Command::SetTx { slot, dbm } => {
            let setting = service.apply_conn_tx_power(slot, dbm)?;
            report_power(out, slot, "conn", setting);
        }
        Command::SetAdvTx { slot, dbm } => {
            check_power(dbm)?;
            let setting = pool.set_adv_tx_power(slot, dbm)?;
            report_power(out, slot, "adv", setting);
        }
        Command::SetPhy { slot, phy } => {
            let conn = connected(service, slot)?;
            pool.link().request_phy_change(conn, phy)?;
            let _ = writeln!(out, "slot {}: phy {:?} requested", slot, phy);
        }
        Command::SetInterval { slot, interval_us } => {
            if !(config::CONN_INTERVAL_MIN_US..=config::CONN_INTERVAL_MAX_US).contains(&interval_us) {
                return Err(Error::ValueOutOfRange);
            }
            let conn = connected(service, slot)?;
            pool.link().set_connection_interval(conn, interval_us)?;
            let _ = writeln!(out, "slot {}: interval {} us requested", slot, interval_us);
        }
    }
    Ok(())
}

fn report_power(out: &mut impl Write, slot: usize, role: &str, setting: PowerSetting) {
    let _ = match setting {
        PowerSetting::Applied(dbm) => writeln!(out, "slot {}: {} tx {} dBm", slot, role, dbm),
        PowerSetting::Stored(dbm) => writeln!(out, "slot {}: {} tx {} dBm stored", slot, role, dbm),
    };
}

fn check_power(dbm: i8) -> Result<(), Error> {
    if (config::TX_POWER_MIN_DBM..=config::TX_POWER_MAX_DBM).contains(&dbm) {
        Ok(())
    } else {
        Err(Error::ValueOutOfRange)
    }
}

fn connected<M: RawMutex, C: Controller, const N: usize>(
    service: &TelemetryService<'_, M, C, N>,
    slot: usize,
) -> Result<ConnHandle, Error> {
    let snap = service.pool().snapshot(slot).ok_or(Error::NoSuchSlot)?;
    match (snap.state, snap.conn) {
        (SlotState::Connected, Some(conn)) => Ok(conn),
        _ => Err(Error::InvalidState),
    }
}
