//! Periodic RSSI sampling.
//!
//! Runs only while the local RSSI characteristic has a subscriber. Each
//! cycle samples every Connected slot; a failure on one link is logged
//! and the others are still sampled.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};

use crate::ble::controller::Controller;
use crate::telemetry::service::TelemetryService;

/// Outcome of one sampling cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickReport {
    pub sampled: usize,
    pub notified: usize,
    pub failed: usize,
}

pub struct RssiScheduler<M: RawMutex> {
    active: AtomicBool,
    wake: Signal<M, ()>,
    period_ms: u64,
}

impl<M: RawMutex> RssiScheduler<M> {
    pub const fn new(period_ms: u64) -> Self {
        Self {
            active: AtomicBool::new(false),
            wake: Signal::new(),
            period_ms,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns `true` if polling was stopped before.
    pub fn start(&self) -> bool {
        let changed = !self.active.swap(true, Ordering::AcqRel);
        if changed {
            info!("[rssi] polling every {} ms", self.period_ms);
            self.wake.signal(());
        }
        changed
    }

    /// Returns `true` if polling was running before. Stopping an idle
    /// scheduler does nothing.
    pub fn stop(&self) -> bool {
        let changed = self.active.swap(false, Ordering::AcqRel);
        if changed {
            info!("[rssi] polling stopped");
            self.wake.signal(());
        }
        changed
    }

    /// One sampling cycle over every Connected slot.
    pub fn tick<C: Controller, const N: usize>(
        &self,
        service: &TelemetryService<'_, M, C, N>,
    ) -> TickReport {
        let pool = service.pool();
        let mut report = TickReport::default();

        for (slot, conn) in pool.connected_links() {
            let rssi = match pool.link().read_signal_strength(conn) {
                Ok(rssi) => rssi,
                Err(e) => {
                    report.failed += 1;
                    warn!("[rssi] slot {} read failed: {:?}", slot, e);
                    continue;
                }
            };
            report.sampled += 1;

            // The link may have been replaced while we were reading.
            if !pool.record_rssi(slot, conn, rssi) {
                debug!("[rssi] slot {} no longer owns {:?}", slot, conn);
                continue;
            }
            trace!("[rssi] slot {}: {} dBm", slot, rssi);

            if service.publish_local_rssi(slot, conn, rssi) {
                report.notified += 1;
            }
        }

        report
    }

    /// Polling loop. Sleeps on the wake signal while stopped; a stop takes
    /// effect before the next read.
    pub async fn run<C: Controller, const N: usize>(
        &self,
        service: &TelemetryService<'_, M, C, N>,
    ) -> ! {
        loop {
            if !self.is_active() {
                self.wake.wait().await;
                continue;
            }

            let period = Timer::after(Duration::from_millis(self.period_ms));
            match select(period, self.wake.wait()).await {
                Either::First(()) => {
                    if self.is_active() {
                        self.tick(service);
                    }
                }
                Either::Second(()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::controller::HciStatus;
    use crate::ble::facade::LinkControl;
    use crate::ble::pool::PairPool;
    use crate::ble::{ConnHandle, PhyMode};
    use crate::mock::{Call, MockController};
    use crate::telemetry::ChannelId;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type TestPool<'a> = PairPool<'a, CriticalSectionRawMutex, MockController, 2>;

    const PAYLOAD: &[u8] = &[0x02, 0x01, 0x06];

    fn connect(pool: &TestPool<'_>, phy: PhyMode, conn: ConnHandle) -> usize {
        let index = pool.allocate(phy, 0, 0, PAYLOAD).unwrap();
        let adv = pool.snapshot(index).unwrap().adv.unwrap();
        pool.on_connection_established(adv, conn).unwrap()
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let sched = RssiScheduler::<CriticalSectionRawMutex>::new(500);
        assert!(!sched.stop());
        assert!(sched.start());
        assert!(!sched.start());
        assert!(sched.is_active());
        assert!(sched.stop());
        assert!(!sched.stop());
        assert!(!sched.is_active());
    }

    #[test]
    fn no_reads_until_a_slot_connects() {
        let link = LinkControl::new(MockController::new());
        let pool = TestPool::new(&link);
        let service = TelemetryService::new(&pool);
        assert!(service.on_subscription_changed(ChannelId::LocalRssi, true));

        pool.allocate(PhyMode::FastShortRange, 0, 0, PAYLOAD).unwrap();
        let report = service.scheduler().tick(&service);
        assert_eq!(report, TickReport::default());
        assert_eq!(link.controller().count(|c| matches!(c, Call::ReadRssi(_))), 0);

        let adv = pool.snapshot(0).unwrap().adv.unwrap();
        pool.on_connection_established(adv, ConnHandle(1)).unwrap();
        link.controller().set_rssi(ConnHandle(1), -58);

        let report = service.scheduler().tick(&service);
        assert_eq!(report.sampled, 1);
        assert_eq!(report.notified, 1);

        let notes = link.controller().notifications();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, ConnHandle(1));
        assert_eq!(notes[0].1, ChannelId::LocalRssi);
        assert_eq!(notes[0].2, vec![(-58i8) as u8]);
        assert_eq!(pool.snapshot(0).unwrap().last_rssi, Some(-58));
    }

    #[test]
    fn failing_slot_does_not_block_others() {
        let link = LinkControl::new(MockController::new());
        let pool = TestPool::new(&link);
        let service = TelemetryService::new(&pool);
        service.on_subscription_changed(ChannelId::LocalRssi, true);

        connect(&pool, PhyMode::FastShortRange, ConnHandle(1));
        connect(&pool, PhyMode::LongRangeRobust, ConnHandle(2));
        link.controller()
            .fail_rssi(ConnHandle(1), HciStatus::COMMAND_DISALLOWED);
        link.controller().set_rssi(ConnHandle(2), -90);

        let report = service.scheduler().tick(&service);
        assert_eq!(
            report,
            TickReport {
                sampled: 1,
                notified: 1,
                failed: 1
            }
        );
        assert_eq!(pool.snapshot(0).unwrap().last_rssi, None);
        assert_eq!(pool.snapshot(1).unwrap().last_rssi, Some(-90));
    }

    #[test]
    fn samples_are_recorded_without_subscriber() {
        let link = LinkControl::new(MockController::new());
        let pool = TestPool::new(&link);
        let service = TelemetryService::new(&pool);
        connect(&pool, PhyMode::FastShortRange, ConnHandle(3));
        link.controller().set_rssi(ConnHandle(3), -40);

        let report = service.scheduler().tick(&service);
        assert_eq!(report.sampled, 1);
        assert_eq!(report.notified, 0);
        assert!(link.controller().notifications().is_empty());
        assert_eq!(service.channel(ChannelId::LocalRssi).value(), -40);
    }

    #[test]
    fn busy_gate_skips_cycle_notification() {
        let link = LinkControl::new(MockController::new());
        let pool = TestPool::new(&link);
        let service = TelemetryService::new(&pool);
        service.on_subscription_changed(ChannelId::LocalRssi, true);
        connect(&pool, PhyMode::FastShortRange, ConnHandle(1));
        link.controller().set_rssi(ConnHandle(1), -50);

        assert_eq!(service.scheduler().tick(&service).notified, 1);
        // First notification never completed.
        assert_eq!(service.scheduler().tick(&service).notified, 0);
        assert_eq!(link.controller().notifications().len(), 1);

        let ticket = link.controller().notifications()[0].3;
        assert!(service.on_notification_complete(ticket));
        assert_eq!(service.scheduler().tick(&service).notified, 1);
    }
}
