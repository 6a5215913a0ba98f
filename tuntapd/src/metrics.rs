//! Implementation of the [`Metrics`] trait which keeps simple counters, reported when the daemon
//! exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;
use tuntap::metrics::Metrics;

#[derive(Debug, Default)]
struct Counters {
    devices_opened: AtomicU64,
    devices_closed: AtomicU64,
    polls_started: AtomicU64,
    polls_stopped: AtomicU64,
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    packets_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    read_errors: AtomicU64,
}

/// Cheaply clonable packet and device counters.
#[derive(Debug, Clone, Default)]
pub struct CounterMetrics {
    counters: Arc<Counters>,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Amount of packets delivered from polled devices.
    pub fn packets_delivered(&self) -> u64 {
        self.counters.packets_delivered.load(Ordering::Relaxed)
    }

    /// Log the current value of all counters.
    pub fn report(&self) {
        let c = &self.counters;
        info!(
            devices_opened = c.devices_opened.load(Ordering::Relaxed),
            devices_closed = c.devices_closed.load(Ordering::Relaxed),
            polls_started = c.polls_started.load(Ordering::Relaxed),
            polls_stopped = c.polls_stopped.load(Ordering::Relaxed),
            packets_read = c.packets_read.load(Ordering::Relaxed),
            bytes_read = c.bytes_read.load(Ordering::Relaxed),
            packets_written = c.packets_written.load(Ordering::Relaxed),
            bytes_written = c.bytes_written.load(Ordering::Relaxed),
            packets_delivered = c.packets_delivered.load(Ordering::Relaxed),
            bytes_delivered = c.bytes_delivered.load(Ordering::Relaxed),
            read_errors = c.read_errors.load(Ordering::Relaxed),
            "Device counters"
        );
    }
}

impl Metrics for CounterMetrics {
    fn device_opened(&self) {
        self.counters.devices_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn device_closed(&self) {
        self.counters.devices_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn poll_started(&self) {
        self.counters.polls_started.fetch_add(1, Ordering::Relaxed);
    }

    fn poll_stopped(&self) {
        self.counters.polls_stopped.fetch_add(1, Ordering::Relaxed);
    }

    fn packet_read(&self, len: usize) {
        self.counters.packets_read.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(len as u64, Ordering::Relaxed);
    }

    fn packet_written(&self, len: usize) {
        self.counters.packets_written.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(len as u64, Ordering::Relaxed);
    }

    fn packet_delivered(&self, len: usize) {
        self.counters
            .packets_delivered
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_delivered
            .fetch_add(len as u64, Ordering::Relaxed);
    }

    fn read_error(&self) {
        self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tuntap::metrics::Metrics;

    use super::CounterMetrics;

    #[test]
    fn clones_share_counters() {
        let metrics = CounterMetrics::new();
        let clone = metrics.clone();

        clone.packet_delivered(60);
        clone.packet_delivered(40);
        metrics.packet_written(20);

        assert_eq!(metrics.packets_delivered(), 2);
        assert_eq!(
            metrics.counters.bytes_delivered.load(Ordering::Relaxed),
            100
        );
        assert_eq!(clone.counters.bytes_written.load(Ordering::Relaxed), 20);
    }
}
