//! Per-device asynchronous execution.
//!
//! Every device owns one [`DeviceQueue`] whose worker runs [`Command`]s in
//! submission order. Ordering across queues comes only from event wait-lists.

pub mod command;
pub mod device_queue;
pub mod event;
pub mod failure;
pub mod fifo;

pub use command::{Command, CommandKind, HostFn, Scratch};
pub use device_queue::DeviceQueue;
pub use event::{total_elapsed, wait_all, Event, EventId, EventStatus};
pub use failure::FailureHandler;
pub use fifo::{CommandSink, LockedFifo, RingFifo};
