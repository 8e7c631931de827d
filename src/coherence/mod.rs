//! Buffer coherence: byte-range validity across the host and every device,
//! and the transfer plans that restore it before a launch.

pub mod buffer;
pub mod engine;
pub mod interval;

pub use buffer::{
    Buffer, BufferFlags, BufferId, CoherenceState, HostShadow, Location, ShadowSync,
};
pub use engine::{
    apply_combine, AccessSet, CoherenceEngine, CombineOp, CombineTransfer, CombineWrite,
    DeviceAccess, ElemType, PeerTransfer, Transfer, TransferPlan,
};
pub use interval::IntervalSet;
