//! How measured timers turn into per-device performance.
//!
//! Chosen once per scheduler from `Config::comm_aware`.

use super::state::{PerfDescriptor, SubKernelSchedInfo};
use std::fmt;

pub trait PerfModel: Send + Sync + fmt::Debug {
    /// Seconds device `device` spent on one launch of the kernel.
    fn sample_secs(&self, info: &SubKernelSchedInfo, device: usize) -> Option<f64>;

    /// Whether transfer costs enter the multi-kernel program.
    fn includes_transfers(&self) -> bool;
}

/// Kernel plus host/device transfer time.
#[derive(Debug, Clone, Copy, Default)]
pub struct WithTransfers;

/// Kernel execution time only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeOnly;

impl PerfModel for WithTransfers {
    fn sample_secs(&self, info: &SubKernelSchedInfo, device: usize) -> Option<f64> {
        let t = info.timers.get(device)?;
        Some(t.mean_kernel_secs()? + t.mean_transfer_secs()?)
    }

    fn includes_transfers(&self) -> bool {
        true
    }
}

impl PerfModel for ComputeOnly {
    fn sample_secs(&self, info: &SubKernelSchedInfo, device: usize) -> Option<f64> {
        info.timers.get(device)?.mean_kernel_secs()
    }

    fn includes_transfers(&self) -> bool {
        false
    }
}

pub fn model_for(comm_aware: bool) -> Box<dyn PerfModel> {
    if comm_aware {
        Box::new(WithTransfers)
    } else {
        Box::new(ComputeOnly)
    }
}

/// Refreshes `info.perf` from the timers and the realized split.
///
/// Devices without a fresh sample keep their previous throughput; devices
/// never measured get the mean of the measured ones.
pub fn update_perf(model: &dyn PerfModel, info: &mut SubKernelSchedInfo) {
    let n = info.num_devices();
    let mut fresh = vec![None; n];
    for d in 0..n {
        let share = info.realized[d].share;
        if share <= 0.0 {
            continue;
        }
        if let Some(secs) = model.sample_secs(info, d) {
            if secs > 0.0 {
                fresh[d] = Some(share / secs);
            }
        }
    }

    for (d, thr) in fresh.into_iter().enumerate() {
        if let Some(thr) = thr {
            info.perf[d] = PerfDescriptor {
                device: d,
                share: info.realized[d].share,
                throughput: thr,
            };
        }
    }

    let known: Vec<f64> = info
        .perf
        .iter()
        .map(|p| p.throughput)
        .filter(|&t| t > 0.0)
        .collect();
    if known.is_empty() {
        return;
    }
    let mean = known.iter().sum::<f64>() / known.len() as f64;
    for p in &mut info.perf {
        if p.throughput <= 0.0 {
            p.throughput = mean;
        }
    }
}

/// The fixed-point map: shares proportional to throughput.
pub fn target_shares(info: &SubKernelSchedInfo) -> Option<Vec<f64>> {
    let total: f64 = info.perf.iter().map(|p| p.throughput).sum();
    if !(total > 0.0) || !total.is_finite() {
        return None;
    }
    Some(info.perf.iter().map(|p| p.throughput / total).collect())
}
