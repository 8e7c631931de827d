//! Logical buffers and their per-location validity.

use super::IntervalSet;
use crate::device::{Device, DeviceMemory};
use crate::error::{Error, Result};
use crate::queue::Event;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::ops::{BitOr, Range};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferFlags(u8);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const READ_ONLY: BufferFlags = BufferFlags(1);
    pub const USE_HOST_PTR: BufferFlags = BufferFlags(1 << 1);
    pub const COPY_HOST_PTR: BufferFlags = BufferFlags(1 << 2);

    pub fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn takes_host_data(self) -> bool {
        self.contains(Self::USE_HOST_PTR) || self.contains(Self::COPY_HOST_PTR)
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

/// Where a copy of buffer bytes lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device(usize),
}

/// Host-resident copy of a logical buffer, shared with queue workers.
#[derive(Debug)]
pub struct HostShadow {
    bytes: RwLock<Vec<u8>>,
}

impl HostShadow {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write()
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps in caller memory of the same length.
    pub(crate) fn replace(&self, bytes: Vec<u8>) {
        *self.bytes.write() = bytes;
    }
}

/// Outstanding commands that touch the host shadow.
///
/// Commands filling the shadow (device to host) must finish before anything
/// reads those bytes; commands reading it (host to device) must finish before
/// the bytes are overwritten.
#[derive(Debug, Default)]
pub struct ShadowSync {
    fills: Vec<Event>,
    readers: Vec<Event>,
}

impl ShadowSync {
    fn prune(events: &mut Vec<Event>) {
        events.retain(|e| !e.is_complete());
    }

    /// Wait-list for a command that reads the shadow.
    pub fn before_read(&mut self) -> Vec<Event> {
        Self::prune(&mut self.fills);
        self.fills.clone()
    }

    /// Wait-list for a command that overwrites the shadow.
    pub fn before_write(&mut self) -> Vec<Event> {
        Self::prune(&mut self.fills);
        Self::prune(&mut self.readers);
        self.fills.iter().chain(self.readers.iter()).cloned().collect()
    }

    pub fn record_read(&mut self, event: Event) {
        self.readers.push(event);
    }

    pub fn record_fill(&mut self, event: Event) {
        self.fills.push(event);
    }

    pub fn outstanding(&mut self) -> usize {
        Self::prune(&mut self.fills);
        Self::prune(&mut self.readers);
        self.fills.len() + self.readers.len()
    }
}

/// Validity of every copy of one logical buffer.
#[derive(Debug)]
pub struct CoherenceState {
    pub(crate) device_valid: Vec<IntervalSet>,
    pub(crate) host_valid: IntervalSet,
    pub(crate) last_writer: Option<Location>,
    pub(crate) shadow_sync: ShadowSync,
}

impl CoherenceState {
    fn new(devices: usize, size: u64) -> Self {
        Self {
            device_valid: vec![IntervalSet::new(); devices],
            host_valid: IntervalSet::from_range(0..size),
            last_writer: None,
            shadow_sync: ShadowSync::default(),
        }
    }

    pub fn device_valid(&self, device: usize) -> &IntervalSet {
        &self.device_valid[device]
    }

    pub fn host_valid(&self) -> &IntervalSet {
        &self.host_valid
    }

    pub fn last_writer(&self) -> Option<Location> {
        self.last_writer
    }

    pub fn valid_at(&self, location: Location) -> &IntervalSet {
        match location {
            Location::Host => &self.host_valid,
            Location::Device(d) => &self.device_valid[d],
        }
    }

    /// Bytes of `0..size` no location holds; empty whenever the state is sound.
    pub fn orphaned(&self, size: u64) -> IntervalSet {
        let mut owned = self.host_valid.clone();
        for v in &self.device_valid {
            owned.union(v);
        }
        IntervalSet::from_range(0..size).difference(&owned)
    }

    pub(crate) fn shadow_sync(&mut self) -> &mut ShadowSync {
        &mut self.shadow_sync
    }

    /// `region` now only holds valid data at `location`.
    pub(crate) fn set_exclusive(&mut self, location: Location, region: &IntervalSet) {
        for r in region.iter() {
            self.host_valid.remove(r.clone());
            for v in self.device_valid.iter_mut() {
                v.remove(r.clone());
            }
        }
        match location {
            Location::Host => self.host_valid.union(region),
            Location::Device(d) => self.device_valid[d].union(region),
        }
        self.last_writer = Some(location);
    }

    pub(crate) fn mark_valid(&mut self, location: Location, region: &IntervalSet) {
        match location {
            Location::Host => self.host_valid.union(region),
            Location::Device(d) => self.device_valid[d].union(region),
        }
    }
}

struct BufferInner {
    id: BufferId,
    size: u64,
    flags: BufferFlags,
    devices: Vec<Arc<dyn Device>>,
    replicas: Vec<DeviceMemory>,
    shadow: Arc<HostShadow>,
    state: Mutex<CoherenceState>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        for (device, mem) in self.devices.iter().zip(self.replicas.iter()) {
            device.release(*mem);
        }
        tracing::trace!(buffer = self.id.0, "released logical buffer");
    }
}

/// A logical buffer: one replica per device plus the host shadow.
///
/// Clones share the buffer; the replicas are released when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Allocates a replica on every device. `host_data`, when given, must be
    /// exactly `size` bytes and becomes the initial content.
    pub fn new(
        devices: &[Arc<dyn Device>],
        size: u64,
        flags: BufferFlags,
        host_data: Option<Vec<u8>>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid("buffer size must be > 0"));
        }
        let shadow = match host_data {
            Some(data) => {
                if data.len() as u64 != size {
                    return Err(Error::invalid(format!(
                        "host data is {} bytes, buffer is {}",
                        data.len(),
                        size
                    )));
                }
                data
            }
            None if flags.takes_host_data() => {
                return Err(Error::invalid("host pointer flag given without host data"))
            }
            None => vec![0u8; size as usize],
        };

        let mut replicas = Vec::with_capacity(devices.len());
        for device in devices {
            match device.allocate(size) {
                Ok(mem) => replicas.push(mem),
                Err(err) => {
                    for (d, mem) in devices.iter().zip(replicas.iter()) {
                        d.release(*mem);
                    }
                    return Err(err);
                }
            }
        }

        let id = BufferId::next();
        tracing::debug!(buffer = id.0, size, devices = devices.len(), "created logical buffer");

        Ok(Self {
            inner: Arc::new(BufferInner {
                id,
                size,
                flags,
                devices: devices.to_vec(),
                replicas,
                shadow: Arc::new(HostShadow::new(shadow)),
                state: Mutex::new(CoherenceState::new(devices.len(), size)),
            }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn flags(&self) -> BufferFlags {
        self.inner.flags
    }

    pub fn num_devices(&self) -> usize {
        self.inner.replicas.len()
    }

    pub fn replica(&self, device: usize) -> DeviceMemory {
        self.inner.replicas[device]
    }

    pub fn shadow(&self) -> &Arc<HostShadow> {
        &self.inner.shadow
    }

    pub fn state(&self) -> MutexGuard<'_, CoherenceState> {
        self.inner.state.lock()
    }

    pub fn retain(&self) -> Buffer {
        self.clone()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn check_range(&self, range: &Range<u64>) -> Result<()> {
        if range.start > range.end || range.end > self.inner.size {
            return Err(Error::invalid(format!(
                "range {}..{} outside buffer of {} bytes",
                range.start, range.end, self.inner.size
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("flags", &self.inner.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    fn devices(n: usize) -> Vec<Arc<dyn Device>> {
        (0..n)
            .map(|i| Arc::new(HostDevice::new(i)) as Arc<dyn Device>)
            .collect()
    }

    #[test]
    fn test_initial_state_is_host_valid() {
        let devs = devices(2);
        let buf = Buffer::new(&devs, 64, BufferFlags::NONE, None).unwrap();
        let state = buf.state();
        assert_eq!(state.host_valid().covered_size(), 64);
        assert!(state.device_valid(0).is_empty());
        assert!(state.last_writer().is_none());
        assert!(state.orphaned(64).is_empty());
    }

    #[test]
    fn test_set_exclusive_invalidates_others() {
        let devs = devices(3);
        let buf = Buffer::new(&devs, 100, BufferFlags::NONE, None).unwrap();
        let mut state = buf.state();
        state.mark_valid(Location::Device(0), &IntervalSet::from_range(0..100));
        state.set_exclusive(Location::Device(1), &IntervalSet::from_range(20..40));
        assert_eq!(state.host_valid().ranges(), &[0..20, 40..100]);
        assert_eq!(state.device_valid(0).ranges(), &[0..20, 40..100]);
        assert_eq!(state.device_valid(1).ranges(), &[20..40]);
        assert_eq!(state.last_writer(), Some(Location::Device(1)));
        assert!(state.orphaned(100).is_empty());
    }

    #[test]
    fn test_replicas_released_with_last_handle() {
        let host = Arc::new(HostDevice::new(0));
        let devs: Vec<Arc<dyn Device>> = vec![host.clone()];
        let buf = Buffer::new(&devs, 8, BufferFlags::COPY_HOST_PTR, Some(vec![1; 8])).unwrap();
        let other = buf.retain();
        assert_eq!(buf.ref_count(), 2);
        drop(buf);
        assert_eq!(host.allocations(), 1);
        drop(other);
        assert_eq!(host.allocations(), 0);
    }

    #[test]
    fn test_host_flag_requires_data() {
        let devs = devices(1);
        assert!(Buffer::new(&devs, 8, BufferFlags::USE_HOST_PTR, None).is_err());
        assert!(Buffer::new(&devs, 8, BufferFlags::NONE, Some(vec![0; 4])).is_err());
        assert!(Buffer::new(&devs, 0, BufferFlags::NONE, None).is_err());
    }
}
