//! Per-kernel scheduling bookkeeping.

use crate::queue::Event;
use std::time::Duration;

/// How much of a kernel's iteration space one device executes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Granularity {
    pub device: usize,
    pub replicas: u32,
    pub share: f64,
}

impl Granularity {
    pub fn new(device: usize, share: f64) -> Self {
        Self {
            device,
            replicas: 1,
            share,
        }
    }
}

/// Measured performance of one device on one kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PerfDescriptor {
    pub device: usize,
    pub share: f64,
    /// Share of the kernel completed per second.
    pub throughput: f64,
}

/// Accumulated times of one device since the timers were last cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceTimers {
    pub kernel: Duration,
    pub h2d: Duration,
    pub d2h: Duration,
    /// Number of kernel executions folded into `kernel`.
    pub samples: u32,
}

impl DeviceTimers {
    pub fn total(&self) -> Duration {
        self.kernel + self.h2d + self.d2h
    }

    /// Mean kernel time per sample in seconds.
    pub fn mean_kernel_secs(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.kernel.as_secs_f64() / self.samples as f64)
    }

    /// Mean transfer time per sample in seconds.
    pub fn mean_transfer_secs(&self) -> Option<f64> {
        (self.samples > 0).then(|| (self.h2d + self.d2h).as_secs_f64() / self.samples as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Uninitialized,
    Probing,
    Stable,
}

/// Broyden memory: inverse-Jacobian estimate over the free shares and the
/// previous iterate.
#[derive(Debug, Clone, Default)]
pub struct SolverMemory {
    pub jacobian: Vec<Vec<f64>>,
    pub prev_x: Option<Vec<f64>>,
    pub prev_g: Option<Vec<f64>>,
}

impl SolverMemory {
    /// Resets the estimate to `-I` over `m` free components.
    pub fn reset(&mut self, m: usize) {
        self.jacobian = (0..m)
            .map(|i| (0..m).map(|j| if i == j { -1.0 } else { 0.0 }).collect())
            .collect();
        self.prev_x = None;
        self.prev_g = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Kernel,
    H2D,
    D2H,
}

/// Scheduling record that lives as long as its kernel.
///
/// `requested` is what the scheduler wants next; `realized` is what the last
/// launch actually ran after work-group rounding.
#[derive(Debug, Default)]
pub struct SubKernelSchedInfo {
    pub requested: Vec<Granularity>,
    pub realized: Vec<Granularity>,
    pub perf: Vec<PerfDescriptor>,
    pub timers: Vec<DeviceTimers>,
    pub iteration: u64,
    pub phase: Phase,
    pub solver: SolverMemory,
    pending: Vec<(EventKind, usize, Event)>,
}

impl SubKernelSchedInfo {
    pub fn is_initialized(&self) -> bool {
        self.phase != Phase::Uninitialized
    }

    /// First-call setup with the naive split.
    pub fn init(&mut self, shares: &[f64]) {
        let n = shares.len();
        self.requested = shares
            .iter()
            .enumerate()
            .map(|(d, &s)| Granularity::new(d, s))
            .collect();
        self.realized = self.requested.clone();
        self.perf = (0..n)
            .map(|d| PerfDescriptor {
                device: d,
                share: shares[d],
                throughput: 0.0,
            })
            .collect();
        self.timers = vec![DeviceTimers::default(); n];
        self.solver.reset(n.saturating_sub(1));
        self.iteration = 0;
        self.phase = Phase::Probing;
    }

    pub fn num_devices(&self) -> usize {
        self.requested.len()
    }

    pub fn requested_shares(&self) -> Vec<f64> {
        self.requested.iter().map(|g| g.share).collect()
    }

    pub fn realized_shares(&self) -> Vec<f64> {
        self.realized.iter().map(|g| g.share).collect()
    }

    pub fn set_requested(&mut self, shares: &[f64]) {
        for (g, &s) in self.requested.iter_mut().zip(shares) {
            g.share = s;
        }
    }

    /// Records the split a launch actually ran; devices absent from
    /// `realized` executed nothing.
    pub fn set_realized(&mut self, realized: &[(usize, f64)]) {
        for g in &mut self.realized {
            g.share = 0.0;
        }
        for &(device, share) in realized {
            if let Some(g) = self.realized.get_mut(device) {
                g.share = share;
            }
        }
    }

    pub fn add_kernel_events(&mut self, events: Vec<(usize, Event)>) {
        self.pending
            .extend(events.into_iter().map(|(d, e)| (EventKind::Kernel, d, e)));
    }

    pub fn add_h2d_events(&mut self, events: Vec<(usize, Event)>) {
        self.pending
            .extend(events.into_iter().map(|(d, e)| (EventKind::H2D, d, e)));
    }

    pub fn add_d2h_events(&mut self, events: Vec<(usize, Event)>) {
        self.pending
            .extend(events.into_iter().map(|(d, e)| (EventKind::D2H, d, e)));
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Folds completed events into the timers; incomplete ones stay pending
    /// and failed ones are discarded. Returns true if nothing is left pending.
    pub fn drain_events(&mut self) -> bool {
        let n = self.timers.len();
        let mut keep = Vec::new();
        for (kind, device, event) in self.pending.drain(..) {
            if !event.status().is_terminal() {
                keep.push((kind, device, event));
                continue;
            }
            let elapsed = match event.elapsed() {
                Some(elapsed) if event.is_complete() && device < n => elapsed,
                _ => continue,
            };
            let timers = &mut self.timers[device];
            match kind {
                EventKind::Kernel => {
                    timers.kernel += elapsed;
                    timers.samples += 1;
                }
                EventKind::H2D => timers.h2d += elapsed,
                EventKind::D2H => timers.d2h += elapsed,
            }
        }
        self.pending = keep;
        self.pending.is_empty()
    }

    /// Adds a synthetic kernel sample, bypassing events.
    pub fn record_sample(&mut self, device: usize, kernel: Duration, h2d: Duration, d2h: Duration) {
        if let Some(t) = self.timers.get_mut(device) {
            t.kernel += kernel;
            t.h2d += h2d;
            t.d2h += d2h;
            t.samples += 1;
        }
    }

    /// Every device that ran part of the last launch has a kernel sample.
    pub fn has_samples(&self) -> bool {
        self.realized
            .iter()
            .all(|g| g.share <= 0.0 || self.timers.get(g.device).map_or(false, |t| t.samples > 0))
    }

    pub fn clear_timers(&mut self) {
        for t in &mut self.timers {
            *t = DeviceTimers::default();
        }
    }

    pub fn clear_events(&mut self) {
        self.pending.clear();
    }
}

/// Forces `shares` onto the simplex: negatives become zero and the last
/// share is one minus the others, rescaling if that would go negative.
pub fn normalize_shares(shares: &mut [f64]) {
    let n = shares.len();
    if n == 0 {
        return;
    }
    for s in shares.iter_mut() {
        if !s.is_finite() || *s < 0.0 {
            *s = 0.0;
        }
    }
    let head: f64 = shares[..n - 1].iter().sum();
    if head <= 1.0 {
        shares[n - 1] = 1.0 - head;
    } else {
        for s in shares[..n - 1].iter_mut() {
            *s /= head;
        }
        shares[n - 1] = 0.0;
    }
}

/// Uniform split over `n` devices.
pub fn uniform_shares(n: usize) -> Vec<f64> {
    let mut shares = vec![1.0 / n.max(1) as f64; n];
    normalize_shares(&mut shares);
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_clamps_and_fixes_last() {
        let mut s = vec![0.7, -0.2, 0.9];
        normalize_shares(&mut s);
        assert_eq!(s[1], 0.0);
        assert_relative_eq!(s.iter().sum::<f64>(), 1.0);
        assert_relative_eq!(s[2], 0.3, epsilon = 1e-12);

        let mut over = vec![0.8, 0.6, 0.1];
        normalize_shares(&mut over);
        assert_eq!(over[2], 0.0);
        assert_relative_eq!(over.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_sums_to_one() {
        for n in 1..8 {
            let s = uniform_shares(n);
            assert_relative_eq!(s.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_drain_keeps_incomplete_events() {
        let mut info = SubKernelSchedInfo::default();
        info.init(&[0.5, 0.5]);
        let done = Event::new(Some(0), "exec");
        done.mark_running();
        done.signal(Ok(()));
        let running = Event::new(Some(1), "exec");
        info.add_kernel_events(vec![(0, done), (1, running.clone())]);

        assert!(!info.drain_events());
        assert_eq!(info.timers[0].samples, 1);
        assert_eq!(info.timers[1].samples, 0);
        assert!(!info.has_samples());

        running.signal(Ok(()));
        assert!(info.drain_events());
        assert!(info.has_samples());
    }

    #[test]
    fn test_excluded_device_needs_no_sample() {
        let mut info = SubKernelSchedInfo::default();
        info.init(&[0.5, 0.5]);
        info.set_realized(&[(0, 1.0)]);
        info.record_sample(0, Duration::from_millis(2), Duration::ZERO, Duration::ZERO);
        assert!(info.has_samples());
    }
}
