//! Per-queue counters and command latency histogram.

use crate::util::CachePadded;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics collected by one device queue worker.
#[derive(Debug)]
pub struct QueueMetrics {
    device: usize,

    // written by the worker on every command
    commands_executed: CachePadded<AtomicU64>,
    busy_time_ns: CachePadded<AtomicU64>,

    commands_failed: AtomicU64,
    kernel_launches: AtomicU64,

    bytes_h2d: AtomicU64,
    bytes_d2h: AtomicU64,

    idle_time_ns: AtomicU64,

    // None only if the histogram bounds were rejected
    latency_histogram: Option<RwLock<Histogram<u64>>>,

    start_time: Instant,
}

impl QueueMetrics {
    pub fn new(device: usize) -> Self {
        // 3 significant figures, max one hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3).ok();

        Self {
            device,
            commands_executed: CachePadded::new(AtomicU64::new(0)),
            busy_time_ns: CachePadded::new(AtomicU64::new(0)),
            commands_failed: AtomicU64::new(0),
            kernel_launches: AtomicU64::new(0),
            bytes_h2d: AtomicU64::new(0),
            bytes_d2h: AtomicU64::new(0),
            idle_time_ns: AtomicU64::new(0),
            latency_histogram: histogram.map(RwLock::new),
            start_time: Instant::now(),
        }
    }

    /// Records one executed command with its duration and traffic.
    pub fn record_command(&self, label: &str, duration: Duration, h2d: u64, d2h: u64) {
        let duration_ns = duration.as_nanos().min(u64::MAX as u128) as u64;
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.busy_time_ns.fetch_add(duration_ns, Ordering::Relaxed);
        self.bytes_h2d.fetch_add(h2d, Ordering::Relaxed);
        self.bytes_d2h.fetch_add(d2h, Ordering::Relaxed);
        if label == "exec" {
            self.kernel_launches.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(mut hist) = self.latency_histogram.as_ref().and_then(|h| h.try_write()) {
            let _ = hist.record(duration_ns);
        }
    }

    pub fn record_failure(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_time(&self, duration: Duration) {
        self.idle_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            timestamp: Instant::now(),
            uptime: self.start_time.elapsed(),
            device: self.device,
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            kernel_launches: self.kernel_launches.load(Ordering::Relaxed),
            bytes_h2d: self.bytes_h2d.load(Ordering::Relaxed),
            bytes_d2h: self.bytes_d2h.load(Ordering::Relaxed),
            idle_time_ns: self.idle_time_ns.load(Ordering::Relaxed),
            busy_time_ns: self.busy_time_ns.load(Ordering::Relaxed),
            avg_latency_ns: 0,
            p50_latency_ns: 0,
            p99_latency_ns: 0,
            max_latency_ns: 0,
        };

        if let Some(histogram) = &self.latency_histogram {
            let histogram = histogram.read();
            if histogram.len() > 0 {
                snapshot.avg_latency_ns = histogram.mean() as u64;
                snapshot.p50_latency_ns = histogram.value_at_quantile(0.50);
                snapshot.p99_latency_ns = histogram.value_at_quantile(0.99);
                snapshot.max_latency_ns = histogram.max();
            }
        }
        snapshot
    }

    pub fn reset(&self) {
        self.commands_executed.store(0, Ordering::Relaxed);
        self.commands_failed.store(0, Ordering::Relaxed);
        self.kernel_launches.store(0, Ordering::Relaxed);
        self.bytes_h2d.store(0, Ordering::Relaxed);
        self.bytes_d2h.store(0, Ordering::Relaxed);
        self.idle_time_ns.store(0, Ordering::Relaxed);
        self.busy_time_ns.store(0, Ordering::Relaxed);

        if let Some(mut hist) = self.latency_histogram.as_ref().and_then(|h| h.try_write()) {
            hist.reset();
        }
    }
}

/// Snapshot of one queue's metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: Instant,
    pub uptime: Duration,
    pub device: usize,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub kernel_launches: u64,
    pub bytes_h2d: u64,
    pub bytes_d2h: u64,
    pub idle_time_ns: u64,
    pub busy_time_ns: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Fraction of observed time the worker spent executing (0.0 to 1.0).
    pub fn utilization(&self) -> f64 {
        let total_time = self.idle_time_ns + self.busy_time_ns;
        if total_time == 0 {
            return 0.0;
        }
        self.busy_time_ns as f64 / total_time as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_metrics_counts_traffic() {
        let metrics = QueueMetrics::new(1);
        metrics.record_command("write", Duration::from_micros(5), 128, 0);
        metrics.record_command("exec", Duration::from_micros(50), 0, 0);
        metrics.record_command("read", Duration::from_micros(7), 0, 64);
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.device, 1);
        assert_eq!(snapshot.commands_executed, 3);
        assert_eq!(snapshot.commands_failed, 1);
        assert_eq!(snapshot.kernel_launches, 1);
        assert_eq!(snapshot.bytes_h2d, 128);
        assert_eq!(snapshot.bytes_d2h, 64);
        assert!(snapshot.avg_latency_ns > 0);
        assert!(snapshot.max_latency_ns >= 50_000);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = QueueMetrics::new(0);
        metrics.record_command("fill", Duration::from_micros(1), 0, 0);
        assert_eq!(metrics.snapshot().commands_executed, 1);
        metrics.reset();
        assert_eq!(metrics.snapshot().commands_executed, 0);
    }

    #[test]
    fn test_utilization() {
        let metrics = QueueMetrics::new(0);
        metrics.record_command("exec", Duration::from_nanos(750), 0, 0);
        metrics.record_idle_time(Duration::from_nanos(250));
        let snapshot = metrics.snapshot();
        assert!((snapshot.utilization() - 0.75).abs() < 1e-9);
    }
}
