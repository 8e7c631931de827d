//! Small concurrency helpers shared by the queues and schedulers.

pub mod atomic;
pub mod backoff;
pub mod cache_padded;

pub use atomic::AtomicF64;
pub use backoff::Backoff;
pub use cache_padded::CachePadded;
