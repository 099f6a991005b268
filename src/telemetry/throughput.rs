//! Throughput test stream.
//!
//! Pushes MTU-sized notifications on the throughput characteristic as
//! fast as each link's gate allows. Every payload starts with a fixed
//! header and ends with a big-endian counter so the receiver can count
//! gaps.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Timer};

use crate::ble::controller::Controller;
use crate::config;
use crate::telemetry::service::TelemetryService;
use crate::telemetry::ChannelId;

pub const PAYLOAD_HEADER: &[u8] = b"Throughput test";

/// Build one payload in `buf`. Returns the number of bytes written, or 0
/// if `buf` cannot hold the header and counter.
pub fn fill_payload(buf: &mut [u8], counter: u32) -> usize {
    let len = buf.len();
    if len < PAYLOAD_HEADER.len() + 4 {
        return 0;
    }
    buf.fill(0);
    buf[..PAYLOAD_HEADER.len()].copy_from_slice(PAYLOAD_HEADER);
    buf[len - 4..].copy_from_slice(&counter.to_be_bytes());
    len
}

pub struct ThroughputStream {
    counter: AtomicU32,
}

impl ThroughputStream {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Payloads handed to the transport so far.
    pub fn sent(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Offer one payload to every connected link. A link whose gate stays
    /// busy for `NOTIFY_ACQUIRE_TIMEOUT_MS` is skipped this round.
    pub async fn pump<M: RawMutex, C: Controller, const N: usize>(
        &self,
        service: &TelemetryService<'_, M, C, N>,
    ) -> usize {
        if !service.is_notify_enabled(ChannelId::Throughput) {
            return 0;
        }

        let mut sent = 0;
        for (slot, conn) in service.pool().connected_links() {
            let Some(gate) = service.gate(slot, ChannelId::Throughput) else {
                continue;
            };
            let timeout = Duration::from_millis(config::NOTIFY_ACQUIRE_TIMEOUT_MS);
            let permit = match gate.acquire_within(timeout).await {
                Ok(permit) => permit,
                Err(e) => {
                    debug!("[tput] slot {} gate busy: {:?}", slot, e);
                    continue;
                }
            };

            let mut buf = [0u8; config::THROUGHPUT_PAYLOAD_LEN];
            let len = fill_payload(&mut buf, self.sent());
            if service.submit(permit, slot, conn, ChannelId::Throughput, &buf[..len]) {
                self.counter.fetch_add(1, Ordering::Relaxed);
                sent += 1;
            }
        }
        sent
    }

    pub async fn run<M: RawMutex, C: Controller, const N: usize>(
        &self,
        service: &TelemetryService<'_, M, C, N>,
    ) -> ! {
        loop {
            if self.pump(service).await == 0 {
                Timer::after(Duration::from_millis(config::THROUGHPUT_IDLE_POLL_MS)).await;
            } else {
                embassy_futures::yield_now().await;
            }
        }
    }
}

impl Default for ThroughputStream {
    fn default() -> Self {
        Self::new()
    }
}
