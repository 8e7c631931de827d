use crate::error::{Error, Result};
use std::time::Duration;

/// Which scheduler family partitions kernel launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SchedulerKind {
    Static,
    FixedPoint,
    GoodBroyden,
    BadBroyden,
    MultiKernel,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::Static
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" | "env" => Ok(SchedulerKind::Static),
            "fixedpoint" | "fixed-point" | "fp" => Ok(SchedulerKind::FixedPoint),
            "broyden" | "good-broyden" => Ok(SchedulerKind::GoodBroyden),
            "badbroyden" | "bad-broyden" => Ok(SchedulerKind::BadBroyden),
            "multikernel" | "multi-kernel" | "mk" => Ok(SchedulerKind::MultiKernel),
            other => Err(Error::config(format!("unknown scheduler '{}'", other))),
        }
    }
}

/// Command FIFO backing each device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FifoKind {
    /// Bounded lock-free ring.
    Ring,
    /// Mutex + condvar list with a timed idle wait.
    Locked,
}

impl Default for FifoKind {
    fn default() -> Self {
        FifoKind::Locked
    }
}

/// What a device queue does when the device rejects a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureStrategy {
    /// Report the failing operation and abort the process.
    Abort,
    /// Complete the command's event as failed and keep the worker running.
    Record,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        FailureStrategy::Abort
    }
}

/// A static split: `numerator / denominator` of the work for each device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticPartition {
    pub denominator: u32,
    /// `(numerator, device_id)` pairs.
    pub shares: Vec<(u32, usize)>,
}

impl StaticPartition {
    pub fn new(denominator: u32, shares: Vec<(u32, usize)>) -> Result<Self> {
        let partition = Self {
            denominator,
            shares,
        };
        partition.validate()?;
        Ok(partition)
    }

    /// Parses `denominator (numerator device_id)*`, separated by spaces or commas.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut tokens = descriptor
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty());

        let denominator = tokens
            .next()
            .ok_or_else(|| Error::config("empty static partition descriptor"))?
            .parse::<u32>()
            .map_err(|e| Error::config(format!("bad partition denominator: {}", e)))?;

        let rest: Vec<&str> = tokens.collect();
        if rest.len() % 2 != 0 {
            return Err(Error::config(
                "static partition needs (numerator, device) pairs",
            ));
        }

        let mut shares = Vec::with_capacity(rest.len() / 2);
        for pair in rest.chunks(2) {
            let numerator = pair[0]
                .parse::<u32>()
                .map_err(|e| Error::config(format!("bad numerator '{}': {}", pair[0], e)))?;
            let device = pair[1]
                .parse::<usize>()
                .map_err(|e| Error::config(format!("bad device id '{}': {}", pair[1], e)))?;
            shares.push((numerator, device));
        }

        Self::new(denominator, shares)
    }

    pub fn validate(&self) -> Result<()> {
        if self.denominator == 0 {
            return Err(Error::config("static partition denominator must be > 0"));
        }
        if self.shares.is_empty() {
            return Err(Error::config("static partition lists no devices"));
        }
        let total: u64 = self.shares.iter().map(|&(n, _)| n as u64).sum();
        if total != self.denominator as u64 {
            return Err(Error::config(format!(
                "static partition numerators sum to {} but denominator is {}",
                total, self.denominator
            )));
        }
        let mut seen: Vec<usize> = self.shares.iter().map(|&(_, d)| d).collect();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::config("static partition repeats a device id"));
        }
        Ok(())
    }

    /// Fraction of the work assigned to `device`.
    pub fn share_of(&self, device: usize) -> f64 {
        self.shares
            .iter()
            .find(|&&(_, d)| d == device)
            .map(|&(n, _)| n as f64 / self.denominator as f64)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Physical devices to aggregate, by index. `None` uses all of them.
    pub devices: Option<Vec<usize>>,
    pub scheduler: SchedulerKind,
    pub static_partition: Option<StaticPartition>,

    /// Number of distinct kernels co-scheduled by the multi-kernel scheduler.
    pub cycle_length: usize,
    /// Launches that keep the initial split before the first adaptive update.
    pub opt_skip: u64,
    /// Adaptive iterations after which the split is declared stable.
    pub opt_nb_skip_iter: u64,
    /// Freeze the split once stable.
    pub opt_stop: bool,
    pub convergence_threshold: f64,

    /// Count transfer time in the per-device cost model.
    pub comm_aware: bool,
    /// Let the host shadow adopt caller memory instead of copying it.
    pub host_copy_elision: bool,
    /// Use device-to-device copies when a backend supports them.
    pub direct_peer_copy: bool,

    pub fifo: FifoKind,
    pub fifo_capacity: usize,
    pub idle_timeout: Duration,
    pub failure_strategy: FailureStrategy,

    pub pin_workers: bool,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,

    #[cfg(feature = "telemetry")]
    pub enable_telemetry: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: None,
            scheduler: SchedulerKind::default(),
            static_partition: None,
            cycle_length: 1,
            opt_skip: 1,
            opt_nb_skip_iter: 20,
            opt_stop: true,
            convergence_threshold: 1e-3,
            comm_aware: true,
            host_copy_elision: false,
            direct_peer_copy: false,
            fifo: FifoKind::default(),
            fifo_capacity: 1024,
            idle_timeout: Duration::from_millis(10),
            failure_strategy: FailureStrategy::default(),
            pin_workers: false,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "vdev-queue".to_string(),
            #[cfg(feature = "telemetry")]
            enable_telemetry: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(devices) = &self.devices {
            if devices.is_empty() {
                return Err(Error::config("device selection list is empty"));
            }
            let mut sorted = devices.clone();
            sorted.sort_unstable();
            if sorted.windows(2).any(|w| w[0] == w[1]) {
                return Err(Error::config("device selection list repeats a device"));
            }
        }

        if let Some(partition) = &self.static_partition {
            partition.validate()?;
        }

        if self.cycle_length == 0 {
            return Err(Error::config("cycle_length must be > 0"));
        }

        if !(self.convergence_threshold > 0.0 && self.convergence_threshold < 1.0) {
            return Err(Error::config("convergence_threshold must be in (0, 1)"));
        }

        if self.fifo_capacity < 2 {
            return Err(Error::config("fifo_capacity must be >= 2"));
        }

        if self.idle_timeout.is_zero() {
            return Err(Error::config("idle_timeout must be > 0"));
        }

        Ok(())
    }

    /// Reads the `VDEV_*` variables on top of the defaults.
    pub fn from_env() -> Result<Config> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Config>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = ConfigBuilder::new();

        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                "VDEV_DEVICES" => {
                    let devices = value
                        .split(|c: char| c.is_whitespace() || c == ',')
                        .filter(|t| !t.is_empty())
                        .map(|t| {
                            t.parse::<usize>()
                                .map_err(|e| Error::config(format!("bad device '{}': {}", t, e)))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    builder = builder.devices(devices);
                }
                "VDEV_SCHEDULER" => builder = builder.scheduler(value.parse()?),
                "VDEV_STATIC_PARTITION" => {
                    builder = builder.static_partition(StaticPartition::parse(value)?)
                }
                "VDEV_CYCLE_LENGTH" => builder = builder.cycle_length(parse_num(key.as_ref(), value)?),
                "VDEV_OPT_SKIP" => builder = builder.opt_skip(parse_num(key.as_ref(), value)?),
                "VDEV_OPT_NB_SKIP_ITER" => {
                    builder = builder.opt_nb_skip_iter(parse_num(key.as_ref(), value)?)
                }
                "VDEV_OPT_STOP" => builder = builder.opt_stop(parse_flag(key.as_ref(), value)?),
                "VDEV_COMM_AWARE" => builder = builder.comm_aware(parse_flag(key.as_ref(), value)?),
                "VDEV_HOST_COPY_ELISION" => {
                    builder = builder.host_copy_elision(parse_flag(key.as_ref(), value)?)
                }
                "VDEV_FIFO" => {
                    let kind = match value.to_ascii_lowercase().as_str() {
                        "ring" => FifoKind::Ring,
                        "locked" | "list" => FifoKind::Locked,
                        other => return Err(Error::config(format!("unknown fifo '{}'", other))),
                    };
                    builder = builder.fifo(kind);
                }
                _ => {}
            }
        }

        builder.build()
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::config(format!("{}: {}", key, e)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("{}: expected a flag, got '{}'", key, other))),
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn devices(mut self, devices: Vec<usize>) -> Self {
        self.config.devices = Some(devices);
        self
    }

    pub fn scheduler(mut self, kind: SchedulerKind) -> Self {
        self.config.scheduler = kind;
        self
    }

    pub fn static_partition(mut self, partition: StaticPartition) -> Self {
        self.config.static_partition = Some(partition);
        self
    }

    pub fn cycle_length(mut self, n: usize) -> Self {
        self.config.cycle_length = n;
        self
    }

    pub fn opt_skip(mut self, n: u64) -> Self {
        self.config.opt_skip = n;
        self
    }

    pub fn opt_nb_skip_iter(mut self, n: u64) -> Self {
        self.config.opt_nb_skip_iter = n;
        self
    }

    pub fn opt_stop(mut self, stop: bool) -> Self {
        self.config.opt_stop = stop;
        self
    }

    pub fn convergence_threshold(mut self, threshold: f64) -> Self {
        self.config.convergence_threshold = threshold;
        self
    }

    pub fn comm_aware(mut self, enable: bool) -> Self {
        self.config.comm_aware = enable;
        self
    }

    pub fn host_copy_elision(mut self, enable: bool) -> Self {
        self.config.host_copy_elision = enable;
        self
    }

    pub fn direct_peer_copy(mut self, enable: bool) -> Self {
        self.config.direct_peer_copy = enable;
        self
    }

    pub fn fifo(mut self, kind: FifoKind) -> Self {
        self.config.fifo = kind;
        self
    }

    pub fn fifo_capacity(mut self, capacity: usize) -> Self {
        self.config.fifo_capacity = capacity;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.config.failure_strategy = strategy;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.config.pin_workers = pin;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    #[cfg(feature = "telemetry")]
    pub fn enable_telemetry(mut self, enable: bool) -> Self {
        self.config.enable_telemetry = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static_partition() {
        let p = StaticPartition::parse("4 1 0 3 1").unwrap();
        assert_eq!(p.denominator, 4);
        assert_eq!(p.shares, vec![(1, 0), (3, 1)]);
        assert_eq!(p.share_of(0), 0.25);
        assert_eq!(p.share_of(1), 0.75);
        assert_eq!(p.share_of(7), 0.0);
    }

    #[test]
    fn test_mismatched_numerators_rejected() {
        let err = StaticPartition::parse("4 2 0 3 1").unwrap_err();
        assert!(err.is_fatal());
        assert!(StaticPartition::parse("4 1 0 3").is_err());
        assert!(StaticPartition::parse("").is_err());
        assert!(StaticPartition::parse("4 2 0 2 0").is_err());
    }

    #[test]
    fn test_builder_validation() {
        assert!(Config::builder().cycle_length(0).build().is_err());
        assert!(Config::builder().devices(vec![]).build().is_err());
        assert!(Config::builder().devices(vec![0, 0]).build().is_err());
        assert!(Config::builder().convergence_threshold(0.0).build().is_err());
        assert!(Config::builder().devices(vec![1, 0]).build().is_ok());
    }

    #[test]
    fn test_from_vars() {
        let vars = vec![
            ("VDEV_SCHEDULER", "bad-broyden"),
            ("VDEV_DEVICES", "0,2"),
            ("VDEV_OPT_STOP", "0"),
            ("VDEV_FIFO", "ring"),
            ("PATH", "/usr/bin"),
        ];
        let config = Config::from_vars(vars).unwrap();
        assert_eq!(config.scheduler, SchedulerKind::BadBroyden);
        assert_eq!(config.devices, Some(vec![0, 2]));
        assert!(!config.opt_stop);
        assert_eq!(config.fifo, FifoKind::Ring);
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        assert!(Config::from_vars(vec![("VDEV_SCHEDULER", "round-robin")]).is_err());
        assert!(Config::from_vars(vec![("VDEV_OPT_STOP", "maybe")]).is_err());
        assert!(Config::from_vars(vec![("VDEV_STATIC_PARTITION", "3 1 0 1 1")]).is_err());
    }
}
