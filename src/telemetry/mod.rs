//! Queue telemetry.
//!
//! Counters and a latency histogram per device queue. Without the
//! `telemetry` feature a no-op stand-in with the same surface is compiled.

#[cfg(feature = "telemetry")]
pub mod metrics;

#[cfg(feature = "telemetry")]
pub use metrics::{MetricsSnapshot, QueueMetrics};

// Stub implementations when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
pub mod metrics {
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone)]
    pub struct QueueMetrics {
        device: usize,
    }

    impl QueueMetrics {
        pub fn new(device: usize) -> Self {
            Self { device }
        }
        pub fn record_command(&self, _: &str, _: Duration, _: u64, _: u64) {}
        pub fn record_failure(&self) {}
        pub fn record_idle_time(&self, _: Duration) {}
        pub fn reset(&self) {}
        pub fn snapshot(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                device: self.device,
                ..MetricsSnapshot::default()
            }
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct MetricsSnapshot {
        pub timestamp: Option<Instant>,
        pub device: usize,
        pub commands_executed: u64,
        pub commands_failed: u64,
        pub kernel_launches: u64,
        pub bytes_h2d: u64,
        pub bytes_d2h: u64,
        pub avg_latency_ns: u64,
        pub p50_latency_ns: u64,
        pub p99_latency_ns: u64,
    }
}

#[cfg(not(feature = "telemetry"))]
pub use metrics::{MetricsSnapshot, QueueMetrics};
