//! Notification flow control.
//!
//! A [`NotifyGate`] lets at most one notification be in flight. The
//! producer takes a [`Permit`] before building a payload and hands it to
//! [`Permit::submit`]; the transport's completion releases the gate via
//! [`NotifyGate::complete`]. When a notification cannot be sent the
//! producer skips it instead of queueing it.
//!
//! Every acquisition carries a sequence number. Only a completion with the
//! current number releases the gate, so a duplicated or late completion
//! can never open it a second time.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GateState {
    Idle,
    /// Permit handed out, payload not yet submitted.
    Reserved(u16),
    /// Submitted, waiting for the transport to complete it.
    InFlight(u16),
}

#[derive(Clone, Copy)]
struct Inner {
    state: GateState,
    next_seq: u16,
}

pub struct NotifyGate<M: RawMutex> {
    inner: Mutex<M, Cell<Inner>>,
    released: Signal<M, ()>,
}

impl<M: RawMutex> NotifyGate<M> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(Inner {
                state: GateState::Idle,
                next_seq: 0,
            })),
            released: Signal::new(),
        }
    }

    pub fn state(&self) -> GateState {
        self.inner.lock(|cell| cell.get().state)
    }

    pub fn is_busy(&self) -> bool {
        self.state() != GateState::Idle
    }

    /// Take the gate if it is idle.
    pub fn try_acquire(&self) -> Option<Permit<'_, M>> {
        let seq = self.update(|g| {
            if g.state != GateState::Idle {
                return None;
            }
            let seq = g.next_seq;
            g.next_seq = g.next_seq.wrapping_add(1);
            g.state = GateState::Reserved(seq);
            Some(seq)
        })?;

        Some(Permit {
            gate: self,
            seq,
            armed: true,
        })
    }

    /// Wait until the gate is idle and take it.
    ///
    /// Unbounded; use [`acquire_within`](Self::acquire_within) when the
    /// transport may stall.
    pub async fn acquire(&self) -> Permit<'_, M> {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            self.released.wait().await;
        }
    }

    /// [`acquire`](Self::acquire), giving up with `Error::Timeout`.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<Permit<'_, M>, Error> {
        Ok(with_timeout(timeout, self.acquire()).await?)
    }

    /// The transport finished with notification `seq`.
    ///
    /// Returns `false`, and leaves the gate alone, when `seq` is not the
    /// notification currently holding it.
    pub fn complete(&self, seq: u16) -> bool {
        let released = self.update(|g| match g.state {
            GateState::InFlight(s) | GateState::Reserved(s) if s == seq => {
                g.state = GateState::Idle;
                true
            }
            _ => false,
        });

        if released {
            self.released.signal(());
        } else {
            debug!("[flow] completion {} ignored", seq);
        }
        released
    }

    /// Force the gate idle, e.g. after the link dropped. Completions for
    /// anything sent before no longer match.
    pub fn reset(&self) {
        let was = self.update(|g| core::mem::replace(&mut g.state, GateState::Idle));
        if was != GateState::Idle {
            self.released.signal(());
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|cell| {
            let mut inner = cell.get();
            let r = f(&mut inner);
            cell.set(inner);
            r
        })
    }

    fn release_reserved(&self, seq: u16) {
        let released = self.update(|g| {
            if g.state == GateState::Reserved(seq) {
                g.state = GateState::Idle;
                true
            } else {
                false
            }
        });
        if released {
            self.released.signal(());
        }
    }
}

impl<M: RawMutex> Default for NotifyGate<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to send one notification through a gate.
///
/// Dropping an unsubmitted permit releases the gate.
pub struct Permit<'a, M: RawMutex> {
    gate: &'a NotifyGate<M>,
    seq: u16,
    armed: bool,
}

impl<M: RawMutex> Permit<'_, M> {
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Hand the payload to the transport.
    ///
    /// `send` receives the sequence number to tag the notification with.
    /// On `Ok` the gate stays held until [`NotifyGate::complete`] is
    /// called with that number; on `Err` it is released before returning.
    pub fn submit<E>(mut self, send: impl FnOnce(u16) -> Result<(), E>) -> Result<(), E> {
        send(self.seq)?;

        let seq = self.seq;
        self.gate.update(|g| {
            // A transport may complete synchronously inside `send`.
            if g.state == GateState::Reserved(seq) {
                g.state = GateState::InFlight(seq);
            }
        });
        self.armed = false;
        Ok(())
    }
}

impl<M: RawMutex> Drop for Permit<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.release_reserved(self.seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type Gate = NotifyGate<CriticalSectionRawMutex>;

    #[test]
    fn second_submission_waits_for_completion() {
        let gate = Gate::new();
        let permit = gate.try_acquire().unwrap();
        let seq = permit.seq();
        permit.submit(|_| Ok::<(), ()>(())).unwrap();
        assert_eq!(gate.state(), GateState::InFlight(seq));

        assert!(gate.try_acquire().is_none());

        assert!(gate.complete(seq));
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn synchronous_failure_releases_gate() {
        let gate = Gate::new();
        let permit = gate.try_acquire().unwrap();
        assert_eq!(permit.submit(|_| Err("queue full")), Err("queue full"));
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[test]
    fn dropped_permit_releases_gate() {
        let gate = Gate::new();
        drop(gate.try_acquire().unwrap());
        assert!(!gate.is_busy());
    }

    #[test]
    fn duplicate_completion_cannot_open_gate_twice() {
        let gate = Gate::new();
        let first = gate.try_acquire().unwrap();
        let first_seq = first.seq();
        first.submit(|_| Ok::<(), ()>(())).unwrap();
        assert!(gate.complete(first_seq));

        let second = gate.try_acquire().unwrap();
        let second_seq = second.seq();
        second.submit(|_| Ok::<(), ()>(())).unwrap();

        // Late duplicate of the first completion.
        assert!(!gate.complete(first_seq));
        assert_eq!(gate.state(), GateState::InFlight(second_seq));
        assert!(gate.try_acquire().is_none());
    }

    #[test]
    fn completion_inside_send_is_honoured() {
        let gate = Gate::new();
        let permit = gate.try_acquire().unwrap();
        permit
            .submit(|seq| {
                assert!(gate.complete(seq));
                Ok::<(), ()>(())
            })
            .unwrap();
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[test]
    fn reset_discards_in_flight_notification() {
        let gate = Gate::new();
        let permit = gate.try_acquire().unwrap();
        let seq = permit.seq();
        permit.submit(|_| Ok::<(), ()>(())).unwrap();

        gate.reset();
        assert!(!gate.is_busy());
        assert!(!gate.complete(seq));
    }

    #[test]
    fn acquire_is_bounded_by_caller_timeout() {
        let gate = Gate::new();
        let permit = gate.try_acquire().unwrap();
        permit.submit(|_| Ok::<(), ()>(())).unwrap();

        let waited = block_on(gate.acquire_within(Duration::from_millis(20)));
        assert_eq!(waited.err(), Some(Error::Timeout));
        assert_eq!(gate.state(), GateState::InFlight(0));
    }

    #[test]
    fn acquire_returns_once_idle() {
        let gate = Gate::new();
        let permit = block_on(gate.acquire());
        assert_eq!(gate.state(), GateState::Reserved(permit.seq()));
    }
}
