//! Single-kernel adaptive partitioning.
//!
//! The split is treated as a fixed point of `g -> normalize(throughput(g))`.
//! Each launch measures per-device throughput under the split that ran and
//! moves toward the fixed point, either directly or with a Broyden
//! quasi-Newton step on `G(x) = F(x) - x`.

use super::perf::{self, PerfModel};
use super::state::{normalize_shares, uniform_shares, Phase, SolverMemory, SubKernelSchedInfo};
use super::{partition_by_shares, Partition, Scheduler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelArg, NdRange};
use crate::util::AtomicF64;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

const DEGENERATE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Solver {
    /// Picard iteration `x <- F(x)`.
    FixedPoint,
    /// Broyden's first method on the inverse Jacobian.
    GoodBroyden,
    /// Broyden's second method.
    BadBroyden,
}

impl Solver {
    /// Next iterate given the split that ran (`x`) and the fixed-point map
    /// evaluated there (`f`). Both sum to one.
    pub fn step(self, memory: &mut SolverMemory, x: &[f64], f: &[f64]) -> Vec<f64> {
        let n = x.len();
        if n <= 1 {
            return vec![1.0; n];
        }
        let mut next = match self {
            Solver::FixedPoint => f.to_vec(),
            Solver::GoodBroyden | Solver::BadBroyden => self.broyden(memory, x, f),
        };
        normalize_shares(&mut next);
        next
    }

    fn broyden(self, memory: &mut SolverMemory, x: &[f64], f: &[f64]) -> Vec<f64> {
        // the last share is dependent, so only the first n-1 are free
        let m = x.len() - 1;
        if memory.jacobian.len() != m {
            memory.reset(m);
        }
        let xs = &x[..m];
        let g: Vec<f64> = (0..m).map(|i| f[i] - x[i]).collect();

        if let (Some(px), Some(pg)) = (&memory.prev_x, &memory.prev_g) {
            let dx: Vec<f64> = (0..m).map(|i| xs[i] - px[i]).collect();
            let dg: Vec<f64> = (0..m).map(|i| g[i] - pg[i]).collect();
            let j = &mut memory.jacobian;
            let j_dg = mat_vec(j, &dg);
            let resid: Vec<f64> = (0..m).map(|i| dx[i] - j_dg[i]).collect();

            match self {
                Solver::GoodBroyden => {
                    // J += (dx - J dg) (dx^T J) / (dx^T J dg)
                    let denom = dot(&dx, &j_dg);
                    if denom.abs() >= DEGENERATE {
                        let dxt_j: Vec<f64> = (0..m)
                            .map(|c| (0..m).map(|r| dx[r] * j[r][c]).sum())
                            .collect();
                        for r in 0..m {
                            for c in 0..m {
                                j[r][c] += resid[r] * dxt_j[c] / denom;
                            }
                        }
                    } else {
                        trace!(denom, "skipping degenerate good Broyden update");
                    }
                }
                Solver::BadBroyden => {
                    // J += (dx - J dg) dg^T / (dg^T dg)
                    let denom = dot(&dg, &dg);
                    if denom >= DEGENERATE {
                        for r in 0..m {
                            for c in 0..m {
                                j[r][c] += resid[r] * dg[c] / denom;
                            }
                        }
                    } else {
                        trace!(denom, "skipping degenerate bad Broyden update");
                    }
                }
                Solver::FixedPoint => {}
            }
        }

        let j_g = mat_vec(&memory.jacobian, &g);
        let mut next: Vec<f64> = (0..m).map(|i| xs[i] - j_g[i]).collect();
        memory.prev_x = Some(xs.to_vec());
        memory.prev_g = Some(g);

        let head: f64 = next.iter().sum();
        next.push(1.0 - head);
        next
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn mat_vec(m: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    m.iter().map(|row| dot(row, v)).collect()
}

/// Adaptive scheduler for kernels launched repeatedly on their own.
#[derive(Debug)]
pub struct SingleKernelScheduler {
    num_devices: usize,
    solver: Solver,
    perf: Box<dyn PerfModel>,
    opt_skip: u64,
    opt_nb_skip_iter: u64,
    opt_stop: bool,
    threshold: f64,
    last_delta: AtomicF64,
}

impl SingleKernelScheduler {
    pub fn new(num_devices: usize, solver: Solver, config: &Config) -> Self {
        Self {
            num_devices,
            solver,
            perf: perf::model_for(config.comm_aware),
            opt_skip: config.opt_skip,
            opt_nb_skip_iter: config.opt_nb_skip_iter,
            opt_stop: config.opt_stop,
            threshold: config.convergence_threshold,
            last_delta: AtomicF64::new(f64::NAN),
        }
    }

    pub fn solver(&self) -> Solver {
        self.solver
    }

    /// Largest share change of the most recent adaptation, NaN before the
    /// first one.
    pub fn last_delta(&self) -> f64 {
        self.last_delta.load(Ordering::Relaxed)
    }

    /// One adaptation step from the timers collected since the last one.
    ///
    /// Does nothing until every device that ran has a sample. Returns the
    /// largest share change applied.
    pub fn adapt(&self, info: &mut SubKernelSchedInfo) -> Option<f64> {
        if !info.has_samples() {
            return None;
        }
        perf::update_perf(self.perf.as_ref(), info);
        info.clear_timers();

        let f = perf::target_shares(info)?;
        let x = info.realized_shares();
        let next = self.solver.step(&mut info.solver, &x, &f);
        let delta = next
            .iter()
            .zip(&info.requested_shares())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        info.set_requested(&next);
        self.last_delta.store(delta, Ordering::Relaxed);

        if delta < self.threshold || info.iteration >= self.opt_nb_skip_iter {
            if info.phase != Phase::Stable {
                debug!(iteration = info.iteration, delta, shares = ?next, "partition stable");
            }
            info.phase = Phase::Stable;
        }
        Some(delta)
    }
}

impl Scheduler for SingleKernelScheduler {
    fn name(&self) -> &'static str {
        match self.solver {
            Solver::FixedPoint => "fixed-point",
            Solver::GoodBroyden => "good-broyden",
            Solver::BadBroyden => "bad-broyden",
        }
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
        let mut info = kernel.sched_info();
        if !info.is_initialized() {
            info.init(&uniform_shares(self.num_devices));
            debug!(kernel = kernel.name(), devices = self.num_devices, "probing");
        } else {
            info.drain_events();
            let frozen = info.phase == Phase::Stable && self.opt_stop;
            if frozen {
                info.clear_timers();
            } else if info.iteration >= self.opt_skip {
                if let Some(delta) = self.adapt(&mut info) {
                    trace!(kernel = kernel.name(), iteration = info.iteration, delta, "adapted");
                }
            } else {
                info.clear_timers();
            }
        }
        info.iteration += 1;

        let shares = info.requested_shares();
        let need_sync = info.phase != Phase::Stable;
        Ok(partition_by_shares(kernel, &mut info, args, range, &shares, need_sync))
    }
}
