pub use crate::coherence::{Buffer, BufferFlags, CombineOp, ElemType, IntervalSet};
pub use crate::config::{Config, ConfigBuilder, FailureStrategy, FifoKind, SchedulerKind, StaticPartition};
pub use crate::context::{Context, PendingRead};
pub use crate::device::{Device, HostDevice};
pub use crate::error::{Error, OrExit, Result};
pub use crate::kernel::{
    AffineAnalysis, ArgAccess, Footprint, Kernel, KernelArg, KernelInvocation, NdRange,
};
pub use crate::queue::{wait_all, Event, EventStatus};
pub use crate::scheduler::Scheduler;

#[cfg(feature = "telemetry")]
pub use crate::telemetry::MetricsSnapshot;
