//! Cyclic multi-kernel co-scheduling.
//!
//! A fixed cycle of `cycle_length` distinct kernels recurs in a stable
//! order. Each kernel is bound to a slot during the first cycle. At every
//! cycle boundary the measured compute cost per unit of share and the
//! fitted transfer cost between consecutive kernels feed a linear program
//! that minimises the device-wise makespan of the whole cycle.

use super::lp::{LinearProgram, Relation};
use super::perf::{self, PerfModel};
use super::regression::LinearFit;
use super::state::{normalize_shares, uniform_shares};
use super::{partition_by_shares, Partition, Scheduler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelArg, KernelId, NdRange};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Relative RMS residual under which a transfer-cost fit stops sampling.
const FIT_TOLERANCE: f64 = 0.1;
/// The program must beat the current split by this fraction to be adopted.
const MIN_IMPROVEMENT: f64 = 1e-3;

#[derive(Debug, Default)]
struct CycleState {
    slots: Vec<Option<Kernel>>,
    calls: u64,
    cycles: u64,
    stable: bool,
    /// Seconds per unit of share, `[slot][device]`; zero when unknown.
    compute: Vec<Vec<f64>>,
    /// Transfer time against moved share, keyed by (slot, previous slot, device).
    comm: HashMap<(usize, usize, usize), LinearFit>,
    last_makespan: Option<f64>,
}

#[derive(Debug)]
pub struct MultiKernelScheduler {
    num_devices: usize,
    cycle_length: usize,
    perf: Box<dyn PerfModel>,
    opt_skip: u64,
    opt_nb_skip_iter: u64,
    opt_stop: bool,
    threshold: f64,
    state: Mutex<CycleState>,
}

/// Cost model of one cycle, used both to build the program and to predict
/// the makespan of a given split.
struct CostModel {
    compute: Vec<Vec<f64>>,
    slope: Vec<Vec<f64>>,
    intercept: Vec<Vec<f64>>,
}

impl CostModel {
    fn makespan(&self, x: &[Vec<f64>]) -> f64 {
        let l = x.len();
        let n = x.first().map_or(0, Vec::len);
        (0..n)
            .map(|d| {
                (0..l)
                    .map(|k| {
                        let p = (k + l - 1) % l;
                        self.compute[k][d] * x[k][d]
                            + self.slope[k][d] * (x[k][d] - x[p][d]).abs()
                            + self.intercept[k][d]
                    })
                    .sum::<f64>()
            })
            .fold(0.0, f64::max)
    }
}

impl MultiKernelScheduler {
    pub fn new(num_devices: usize, config: &Config) -> Result<Self> {
        if config.cycle_length == 0 {
            return Err(Error::config("cycle_length must be > 0"));
        }
        Ok(Self {
            num_devices,
            cycle_length: config.cycle_length,
            perf: perf::model_for(config.comm_aware),
            opt_skip: config.opt_skip,
            opt_nb_skip_iter: config.opt_nb_skip_iter,
            opt_stop: config.opt_stop,
            threshold: config.convergence_threshold,
            state: Mutex::new(CycleState {
                slots: vec![None; config.cycle_length],
                compute: vec![vec![0.0; num_devices]; config.cycle_length],
                ..Default::default()
            }),
        })
    }

    pub fn cycle_length(&self) -> usize {
        self.cycle_length
    }

    /// Completed cycle boundaries that produced an update.
    pub fn cycles(&self) -> u64 {
        self.state.lock().cycles
    }

    pub fn is_stable(&self) -> bool {
        self.state.lock().stable
    }

    pub fn bound_kernels(&self) -> Vec<Option<KernelId>> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|s| s.as_ref().map(Kernel::id))
            .collect()
    }

    /// Predicted makespan of the split adopted at the last boundary.
    pub fn predicted_makespan(&self) -> Option<f64> {
        self.state.lock().last_makespan
    }

    fn bind(&self, st: &mut CycleState, slot: usize, kernel: &Kernel) -> Result<()> {
        if let Some(bound) = &st.slots[slot] {
            if bound.id() == kernel.id() {
                return Ok(());
            }
            return Err(Error::config(format!(
                "cycle slot {} is bound to kernel '{}', got '{}'",
                slot,
                bound.name(),
                kernel.name()
            )));
        }
        if let Some(other) = st
            .slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |k| k.id() == kernel.id()))
        {
            return Err(Error::config(format!(
                "kernel '{}' already bound to cycle slot {}, seen again at slot {}",
                kernel.name(),
                other,
                slot
            )));
        }
        debug!(slot, kernel = kernel.name(), "bound cycle slot");
        st.slots[slot] = Some(kernel.retain());
        Ok(())
    }

    fn clear_samples(kernels: &[Kernel]) {
        for kernel in kernels {
            let mut info = kernel.sched_info();
            info.clear_timers();
            info.clear_events();
        }
    }

    fn cycle_boundary(&self, st: &mut CycleState) {
        let kernels: Vec<Kernel> = st.slots.iter().flatten().cloned().collect();
        if kernels.len() != self.cycle_length {
            return;
        }
        if st.stable && self.opt_stop {
            Self::clear_samples(&kernels);
            return;
        }

        let l = self.cycle_length;
        let n = self.num_devices;
        let mut x = vec![vec![0.0; n]; l];
        let mut transfer = vec![vec![None; n]; l];
        for (k, kernel) in kernels.iter().enumerate() {
            let mut info = kernel.sched_info();
            info.drain_events();
            if !info.has_samples() {
                trace!(slot = k, "cycle incomplete, keep sampling");
                return;
            }
            x[k] = info.realized_shares();
            for d in 0..n {
                let share = x[k][d];
                if share <= 0.0 {
                    continue;
                }
                if let Some(secs) = info.timers[d].mean_kernel_secs() {
                    if secs > 0.0 {
                        st.compute[k][d] = secs / share;
                    }
                }
                transfer[k][d] = info.timers[d].mean_transfer_secs();
            }
        }
        Self::clear_samples(&kernels);

        if st.calls / l as u64 <= self.opt_skip {
            return;
        }

        if self.perf.includes_transfers() {
            for k in 0..l {
                let p = (k + l - 1) % l;
                for d in 0..n {
                    if let Some(secs) = transfer[k][d] {
                        let fit = st.comm.entry((k, p, d)).or_default();
                        fit.add((x[k][d] - x[p][d]).abs(), secs);
                        fit.settle(FIT_TOLERANCE);
                    }
                }
            }
        }

        // unmeasured devices get the kernel's mean cost
        for row in &mut st.compute {
            let known: Vec<f64> = row.iter().copied().filter(|&c| c > 0.0).collect();
            if known.is_empty() {
                continue;
            }
            let mean = known.iter().sum::<f64>() / known.len() as f64;
            for c in row.iter_mut().filter(|c| **c <= 0.0) {
                *c = mean;
            }
        }
        if st.compute.iter().any(|row| row.iter().all(|&c| c <= 0.0)) {
            return;
        }

        let model = self.cost_model(st);
        let current = model.makespan(&x);
        st.cycles += 1;

        let next = match solve_cycle(&model, &x) {
            Ok(next) => next,
            Err(err) => {
                warn!(error = %err, "cycle program failed, keeping partition");
                self.mark_progress(st, 0.0);
                return;
            }
        };
        let predicted = model.makespan(&next);
        if predicted >= current * (1.0 - MIN_IMPROVEMENT) {
            debug!(current, predicted, "no improving split");
            st.last_makespan = Some(current);
            self.mark_progress(st, 0.0);
            return;
        }

        let mut delta = 0.0f64;
        for (k, kernel) in kernels.iter().enumerate() {
            let mut info = kernel.sched_info();
            let old = info.requested_shares();
            for (a, b) in next[k].iter().zip(&old) {
                delta = delta.max((a - b).abs());
            }
            info.set_requested(&next[k]);
        }
        debug!(cycle = st.cycles, current, predicted, delta, "adopted new cycle split");
        st.last_makespan = Some(predicted);
        self.mark_progress(st, delta);
    }

    fn mark_progress(&self, st: &mut CycleState, delta: f64) {
        if !st.stable && (delta < self.threshold || st.cycles >= self.opt_nb_skip_iter) {
            debug!(cycles = st.cycles, "cycle partition stable");
            st.stable = true;
        }
    }

    fn cost_model(&self, st: &CycleState) -> CostModel {
        let l = self.cycle_length;
        let n = self.num_devices;
        let mut slope = vec![vec![0.0; n]; l];
        let mut intercept = vec![vec![0.0; n]; l];
        if self.perf.includes_transfers() {
            for k in 0..l {
                let p = (k + l - 1) % l;
                for d in 0..n {
                    if let Some(fit) = st.comm.get(&(k, p, d)) {
                        slope[k][d] = fit.slope().max(0.0);
                        intercept[k][d] = fit.intercept().max(0.0);
                    }
                }
            }
        }
        CostModel {
            compute: st.compute.clone(),
            slope,
            intercept,
        }
    }
}

/// Variables: `x[k][d]`, then `u[k][d] >= |x[k][d] - x[p][d]|`, then `T`.
fn solve_cycle(model: &CostModel, current: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let l = current.len();
    let n = current.first().map_or(0, Vec::len);
    let xv = |k: usize, d: usize| k * n + d;
    let uv = |k: usize, d: usize| l * n + k * n + d;
    let t = 2 * l * n;

    let mut lp = LinearProgram::new(2 * l * n + 1);
    lp.minimize(t, 1.0);

    for d in 0..n {
        let mut terms = vec![(t, -1.0)];
        let mut constant = 0.0;
        for k in 0..l {
            terms.push((xv(k, d), model.compute[k][d]));
            terms.push((uv(k, d), model.slope[k][d]));
            constant += model.intercept[k][d];
        }
        lp.constrain(&terms, Relation::Le, -constant);
    }

    for k in 0..l {
        let terms: Vec<(usize, f64)> = (0..n).map(|d| (xv(k, d), 1.0)).collect();
        lp.constrain(&terms, Relation::Eq, 1.0);

        let p = (k + l - 1) % l;
        if p == k {
            continue;
        }
        for d in 0..n {
            lp.constrain(
                &[(uv(k, d), 1.0), (xv(k, d), -1.0), (xv(p, d), 1.0)],
                Relation::Ge,
                0.0,
            );
            lp.constrain(
                &[(uv(k, d), 1.0), (xv(k, d), 1.0), (xv(p, d), -1.0)],
                Relation::Ge,
                0.0,
            );
        }
    }

    let solution = lp.solve()?;
    Ok((0..l)
        .map(|k| {
            let mut shares: Vec<f64> = (0..n).map(|d| solution.x[xv(k, d)]).collect();
            normalize_shares(&mut shares);
            shares
        })
        .collect())
}

impl Scheduler for MultiKernelScheduler {
    fn name(&self) -> &'static str {
        "multi-kernel"
    }

    fn get_partition(
        &self,
        kernel: &Kernel,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<Partition> {
        if self.num_devices == 0 {
            return Err(Error::scheduler("no devices to schedule on"));
        }
        let need_sync = {
            let mut st = self.state.lock();
            let slot = (st.calls % self.cycle_length as u64) as usize;
            self.bind(&mut st, slot, kernel)?;
            if slot == 0 && st.calls >= self.cycle_length as u64 {
                self.cycle_boundary(&mut st);
            }
            st.calls += 1;
            !st.stable
        };

        let mut info = kernel.sched_info();
        if !info.is_initialized() {
            info.init(&uniform_shares(self.num_devices));
        }
        info.iteration += 1;
        let shares = info.requested_shares();
        Ok(partition_by_shares(kernel, &mut info, args, range, &shares, need_sync))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::AffineAnalysis;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn kernel(name: &str) -> Kernel {
        let body = crate::kernel::body(|_| Ok(()));
        Kernel::new(name, Arc::new(AffineAnalysis::builder().scalar().build()), body)
    }

    fn scheduler(cycle: usize, devices: usize) -> MultiKernelScheduler {
        let config = Config::builder()
            .cycle_length(cycle)
            .opt_skip(0)
            .opt_nb_skip_iter(50)
            .opt_stop(false)
            .comm_aware(false)
            .build()
            .unwrap();
        MultiKernelScheduler::new(devices, &config).unwrap()
    }

    #[test]
    fn test_slot_rebinding_is_config_error() {
        let s = scheduler(2, 2);
        let (a, b, c) = (kernel("a"), kernel("b"), kernel("c"));
        let args = [KernelArg::scalar_u32(0)];
        let range = NdRange::linear(64);
        s.get_partition(&a, &args, &range).unwrap();
        s.get_partition(&b, &args, &range).unwrap();
        s.get_partition(&a, &args, &range).unwrap();
        let err = s.get_partition(&c, &args, &range).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(s.bound_kernels(), vec![Some(a.id()), Some(b.id())]);
    }

    #[test]
    fn test_kernel_in_two_slots_rejected() {
        let s = scheduler(2, 2);
        let a = kernel("a");
        let args = [KernelArg::scalar_u32(0)];
        let range = NdRange::linear(8);
        s.get_partition(&a, &args, &range).unwrap();
        assert!(s.get_partition(&a, &args, &range).is_err());
    }

    #[test]
    fn test_cycle_balances_device_load() {
        let s = scheduler(2, 2);
        let speed = [1.0, 3.0];
        let kernels = [kernel("k0"), kernel("k1")];
        let args = [KernelArg::scalar_u32(0)];
        let range = NdRange::linear(1 << 16);

        for _ in 0..6 {
            for k in &kernels {
                let partition = s.get_partition(k, &args, &range).unwrap();
                let mut info = k.sched_info();
                for (d, share) in partition.shares(range.global()[0]) {
                    let secs = share / speed[d] * 1e-3;
                    info.record_sample(d, Duration::from_secs_f64(secs), Duration::ZERO, Duration::ZERO);
                }
            }
        }

        assert!(s.cycles() >= 1);
        let load: Vec<f64> = (0..2)
            .map(|d| {
                kernels
                    .iter()
                    .map(|k| k.sched_info().requested[d].share / speed[d])
                    .sum()
            })
            .collect();
        assert_relative_eq!(load[0], load[1], epsilon = 1e-3);
        for k in &kernels {
            assert_relative_eq!(k.sched_info().requested_shares().iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
    }
}
