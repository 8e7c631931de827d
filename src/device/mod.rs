//! Physical device abstraction.
//!
//! The runtime drives real accelerators only through [`Device`]. Each method
//! is called from the device's own queue worker, never concurrently for the
//! same device.

pub mod host;

pub use host::{HostDevice, HostDeviceBuilder};

use crate::error::{Error, Result};
use crate::kernel::{KernelBody, NdRange};
use std::fmt;
use std::ops::Range;

/// Handle to one physical allocation on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemory {
    pub device: usize,
    pub id: u64,
    pub size: u64,
}

/// Kernel argument after logical buffers were resolved to replicas.
#[derive(Debug, Clone)]
pub enum LaunchArg {
    Buffer(DeviceMemory),
    Scalar(Vec<u8>),
}

pub trait Device: Send + Sync + fmt::Debug {
    /// Physical identifier. A context addresses devices by their position in
    /// its own list, which may differ after device selection.
    fn index(&self) -> usize;

    fn name(&self) -> &str;

    fn allocate(&self, size: u64) -> Result<DeviceMemory>;

    fn release(&self, mem: DeviceMemory);

    fn write(&self, mem: DeviceMemory, offset: u64, data: &[u8]) -> Result<()>;

    fn read(&self, mem: DeviceMemory, offset: u64, out: &mut [u8]) -> Result<()>;

    fn fill(&self, mem: DeviceMemory, range: Range<u64>, pattern: &[u8]) -> Result<()>;

    /// Runs `body` over `range`. Each buffer argument names a distinct
    /// allocation; the body gets exclusive access to all of them at once.
    fn launch(&self, body: &KernelBody, range: &NdRange, args: &[LaunchArg]) -> Result<()>;

    /// Devices sharing a peer group can copy between each other directly.
    fn peer_group(&self) -> Option<u32> {
        None
    }

    fn supports_peer(&self, other: &dyn Device) -> bool {
        match (self.peer_group(), other.peer_group()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Copies `range` of `src_mem` on `self` into `dst_mem` on `dst`.
    fn copy_to_peer(
        &self,
        dst: &dyn Device,
        src_mem: DeviceMemory,
        dst_mem: DeviceMemory,
        range: Range<u64>,
    ) -> Result<()> {
        if !self.supports_peer(dst) {
            return Err(Error::Unsupported(format!(
                "no direct path from {} to {}",
                self.name(),
                dst.name()
            )));
        }
        let mut staging = vec![0u8; (range.end - range.start) as usize];
        self.read(src_mem, range.start, &mut staging)?;
        dst.write(dst_mem, range.start, &staging)
    }
}

pub(crate) fn check_bounds(
    device: usize,
    op: &'static str,
    mem: &DeviceMemory,
    offset: u64,
    len: u64,
) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= mem.size => Ok(()),
        _ => Err(Error::device(
            device,
            op,
            format!(
                "range {}..{} outside allocation of {} bytes",
                offset,
                offset.saturating_add(len),
                mem.size
            ),
        )),
    }
}
