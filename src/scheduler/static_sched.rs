//! Fixed work split, from configuration or uniform across devices.

use super::state::{uniform_shares, Phase};
use super::{partition_by_shares, Partition, Scheduler};
use crate::config::StaticPartition;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelArg, NdRange};
use tracing::debug;

/// Fixed split, from configuration or uniform. Never adapts.
#[derive(Debug, Clone)]
pub struct StaticScheduler {
    shares: Vec<f64>,
}

impl StaticScheduler {
    /// Fails with a configuration error if the partition is malformed or
    /// names a device that does not exist.
    pub fn new(num_devices: usize, partition: Option<&StaticPartition>) -> Result<Self> {
        if num_devices == 0 {
            return Err(Error::config("static scheduler needs at least one device"));
        }
        let shares = match partition {
            None => uniform_shares(num_devices),
            Some(p) => {
                p.validate()?;
                if let Some(&(_, d)) = p.shares.iter().find(|&&(_, d)| d >= num_devices) {
                    return Err(Error::config(format!(
                        "static partition names device {} but only {} exist",
                        d, num_devices
                    )));
                }
                (0..num_devices).map(|d| p.share_of(d)).collect()
            }
        };
        debug!(?shares, "static partition");
        Ok(Self { shares })
    }

    pub fn shares(&self) -> &[f64] {
        &self.shares
    }
}

impl Scheduler for StaticScheduler {
    fn name(&self) -> &'static str {
        "static"
    }

    fn get_partition(
        &self,
        kernel: &Kernel,
        args: &[KernelArg],
        range: &NdRange,
    ) -> Result<Partition> {
        let mut info = kernel.sched_info();
        if !info.is_initialized() {
            info.init(&self.shares);
            info.phase = Phase::Stable;
        }
        // timings are not used; keep the event list from growing
        info.clear_events();
        info.iteration += 1;
        Ok(partition_by_shares(
            kernel,
            &mut info,
            args,
            range,
            &self.shares,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_quarters() {
        let p = StaticPartition::parse("4 1 0 3 1").unwrap();
        let s = StaticScheduler::new(2, Some(&p)).unwrap();
        assert_eq!(s.shares(), &[0.25, 0.75]);
    }

    #[test]
    fn test_uniform_default() {
        let s = StaticScheduler::new(4, None).unwrap();
        assert!(s.shares().iter().all(|&x| (x - 0.25).abs() < 1e-12));
    }

    #[test]
    fn test_unknown_device_is_config_error() {
        let p = StaticPartition::new(2, vec![(1, 0), (1, 5)]).unwrap();
        let err = StaticScheduler::new(2, Some(&p)).unwrap_err();
        assert!(err.is_fatal());
    }
}
