//! Work partitioning across devices.
//!
//! A scheduler decides what fraction of each launch every device executes.
//! Three families share one interface: a fixed split, single-kernel adaptive
//! root finding, and multi-kernel cyclic co-scheduling by linear programming.

pub mod lp;
pub mod multi;
pub mod perf;
pub mod regression;
pub mod single;
pub mod state;
pub mod static_sched;

pub use lp::{LinearProgram, LpSolution, Relation};
pub use multi::MultiKernelScheduler;
pub use perf::{ComputeOnly, PerfModel, WithTransfers};
pub use regression::LinearFit;
pub use single::{SingleKernelScheduler, Solver};
pub use state::{DeviceTimers, Granularity, PerfDescriptor, Phase, SubKernelSchedInfo};
pub use static_sched::StaticScheduler;

use crate::coherence::AccessSet;
use crate::config::{Config, SchedulerKind};
use crate::error::Result;
use crate::kernel::{Kernel, KernelArg, NdRange};
use crate::queue::Event;
use std::fmt;

/// The part of a launch one device executes.
#[derive(Debug, Clone)]
pub struct SubKernel {
    pub device: usize,
    pub range: NdRange,
    /// Bytes the sub-kernel needs valid beforehand and bytes it produces.
    pub access: AccessSet,
}

#[derive(Debug, Clone)]
pub struct Partition {
    /// The split is provisional; the caller must wait for this launch before
    /// issuing the next so its timings are sampled.
    pub need_sync: bool,
    pub subkernels: Vec<SubKernel>,
}

impl Partition {
    pub fn devices(&self) -> impl Iterator<Item = usize> + '_ {
        self.subkernels.iter().map(|s| s.device)
    }

    /// Fraction of the global range each participating device runs.
    pub fn shares(&self, total: u64) -> Vec<(usize, f64)> {
        self.subkernels
            .iter()
            .map(|s| {
                let items = s.range.global()[0];
                (s.device, items as f64 / total.max(1) as f64)
            })
            .collect()
    }
}

pub trait Scheduler: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn get_partition(&self, kernel: &Kernel, args: &[KernelArg], range: &NdRange)
        -> Result<Partition>;

    /// Completion events of the host-to-device transfers issued for the
    /// latest partition of `kernel`.
    fn set_h2d_events(&self, kernel: &Kernel, events: Vec<(usize, Event)>) {
        kernel.sched_info().add_h2d_events(events);
    }

    fn set_d2h_events(&self, kernel: &Kernel, events: Vec<(usize, Event)>) {
        kernel.sched_info().add_d2h_events(events);
    }

    fn set_kernel_events(&self, kernel: &Kernel, events: Vec<(usize, Event)>) {
        kernel.sched_info().add_kernel_events(events);
    }
}

/// Splits `range` by `shares` and derives each piece's accesses.
///
/// Records the realized split in the kernel's scheduling state.
pub(crate) fn partition_by_shares(
    kernel: &Kernel,
    info: &mut SubKernelSchedInfo,
    args: &[KernelArg],
    range: &NdRange,
    shares: &[f64],
    need_sync: bool,
) -> Partition {
    let weighted: Vec<(usize, f64)> = shares.iter().copied().enumerate().collect();
    let total = range.global()[0];
    let pieces = range.split(&weighted);

    let realized: Vec<(usize, f64)> = pieces
        .iter()
        .map(|(d, r)| (*d, r.global()[0] as f64 / total.max(1) as f64))
        .collect();
    info.set_realized(&realized);

    let subkernels = pieces
        .into_iter()
        .map(|(device, range)| SubKernel {
            device,
            access: kernel.access(args, &range),
            range,
        })
        .collect();
    Partition {
        need_sync,
        subkernels,
    }
}

/// Builds the scheduler `config` selects for `num_devices` devices.
pub fn from_config(config: &Config, num_devices: usize) -> Result<Box<dyn Scheduler>> {
    Ok(match config.scheduler {
        SchedulerKind::Static => Box::new(StaticScheduler::new(
            num_devices,
            config.static_partition.as_ref(),
        )?),
        SchedulerKind::FixedPoint => {
            Box::new(SingleKernelScheduler::new(num_devices, Solver::FixedPoint, config))
        }
        SchedulerKind::GoodBroyden => {
            Box::new(SingleKernelScheduler::new(num_devices, Solver::GoodBroyden, config))
        }
        SchedulerKind::BadBroyden => {
            Box::new(SingleKernelScheduler::new(num_devices, Solver::BadBroyden, config))
        }
        SchedulerKind::MultiKernel => Box::new(MultiKernelScheduler::new(num_devices, config)?),
    })
}
