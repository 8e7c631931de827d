//! vdev - several compute devices driven as one
//!
//! Kernel launches against a logical device are split across the physical
//! devices behind it. Each logical buffer keeps a replica per device plus a
//! host shadow, and the runtime moves only the bytes a sub-kernel is missing.
//! The split is either fixed, tuned per kernel from measured throughput, or
//! co-optimized across a cycle of kernels by linear programming.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vdev::prelude::*;
//!
//! let devices: Vec<Arc<dyn Device>> = (0..2)
//!     .map(|i| Arc::new(HostDevice::new(i)) as Arc<dyn Device>)
//!     .collect();
//! let ctx = Context::new(devices, Config::default()).unwrap();
//!
//! let data: Vec<u8> = (0..1024u32).flat_map(|v| v.to_le_bytes()).collect();
//! let buf = ctx
//!     .create_buffer(4096, BufferFlags::COPY_HOST_PTR, Some(&data))
//!     .unwrap();
//!
//! let analysis = AffineAnalysis::builder()
//!     .global(ArgAccess::ReadWrite, Footprint::Linear { elem_size: 4, per_item: 1 })
//!     .build();
//! let kernel = Kernel::new("inc", Arc::new(analysis), vdev::kernel::body(|inv| {
//!     let rows = inv.range().dim0();
//!     let out = inv.buffer(0)?;
//!     for i in rows {
//!         let i = i as usize * 4;
//!         let v = u32::from_le_bytes([out[i], out[i + 1], out[i + 2], out[i + 3]]);
//!         out[i..i + 4].copy_from_slice(&(v + 1).to_le_bytes());
//!     }
//!     Ok(())
//! }));
//! kernel.set_arg(0, KernelArg::Buffer(buf.clone())).unwrap();
//!
//! ctx.enqueue_nd_range_kernel(&kernel, &NdRange::linear(1024)).unwrap();
//! let bytes = ctx.enqueue_read_buffer(&buf, 0, 4096).unwrap().wait().unwrap();
//! assert_eq!(&bytes[..4], &1u32.to_le_bytes());
//! ```
//!
//! # Features
//!
//! - **Coherence**: per-device validity tracked as byte interval sets
//! - **Adaptive partitioning**: fixed-point and Broyden solvers per kernel
//! - **Multi-kernel co-scheduling**: cyclic LP over compute and transfer cost
//! - **Device queues**: one in-order worker per device, event wait-lists
//! - **Telemetry**: per-queue counters and latency histograms (optional)

#![warn(missing_debug_implementations)]

pub mod coherence;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod kernel;
pub mod prelude;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod util;

pub use coherence::{Buffer, BufferFlags, IntervalSet};
pub use config::{Config, ConfigBuilder, SchedulerKind, StaticPartition};
pub use context::{Context, PendingRead};
pub use error::{Error, Result};
pub use kernel::{Kernel, KernelArg, NdRange};
pub use queue::Event;
