//! A device that keeps its memory in host RAM and runs kernel bodies on the
//! calling thread. Optional per-item cost and failure injection make it
//! usable for exercising the schedulers.

use super::{check_bounds, Device, DeviceMemory, LaunchArg};
use crate::error::{Error, Result};
use crate::kernel::{InvocationArg, KernelBody, KernelInvocation, NdRange};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct HostDevice {
    index: usize,
    name: String,
    memories: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
    cost_per_item: Duration,
    cost_per_byte: Duration,
    peer_group: Option<u32>,
    fail_on: Mutex<Option<&'static str>>,
    launches: AtomicU64,
}

#[derive(Debug)]
pub struct HostDeviceBuilder {
    index: usize,
    name: Option<String>,
    cost_per_item: Duration,
    cost_per_byte: Duration,
    peer_group: Option<u32>,
}

impl HostDeviceBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Simulated compute cost per work-item.
    pub fn cost_per_item(mut self, cost: Duration) -> Self {
        self.cost_per_item = cost;
        self
    }

    /// Simulated transfer cost per byte for reads and writes.
    pub fn cost_per_byte(mut self, cost: Duration) -> Self {
        self.cost_per_byte = cost;
        self
    }

    pub fn peer_group(mut self, group: u32) -> Self {
        self.peer_group = Some(group);
        self
    }

    pub fn build(self) -> HostDevice {
        HostDevice {
            index: self.index,
            name: self
                .name
                .unwrap_or_else(|| format!("host-device-{}", self.index)),
            memories: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cost_per_item: self.cost_per_item,
            cost_per_byte: self.cost_per_byte,
            peer_group: self.peer_group,
            fail_on: Mutex::new(None),
            launches: AtomicU64::new(0),
        }
    }
}

impl HostDevice {
    pub fn new(index: usize) -> Self {
        Self::builder(index).build()
    }

    pub fn builder(index: usize) -> HostDeviceBuilder {
        HostDeviceBuilder {
            index,
            name: None,
            cost_per_item: Duration::ZERO,
            cost_per_byte: Duration::ZERO,
            peer_group: None,
        }
    }

    /// Makes every subsequent `op` ("write", "read", "fill", "launch") fail.
    pub fn inject_failure(&self, op: Option<&'static str>) {
        *self.fail_on.lock() = op;
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> usize {
        self.memories.lock().len()
    }

    /// Direct view of a replica, for tests.
    pub fn snapshot(&self, mem: DeviceMemory) -> Option<Vec<u8>> {
        self.memories.lock().get(&mem.id).cloned()
    }

    fn check_failure(&self, op: &'static str) -> Result<()> {
        match *self.fail_on.lock() {
            Some(failing) if failing == op => {
                Err(Error::device(self.index, op, "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn simulate(cost: Duration, units: u64) {
        if cost.is_zero() || units == 0 {
            return;
        }
        let units = units.min(u32::MAX as u64) as u32;
        std::thread::sleep(cost * units);
    }
}

impl Device for HostDevice {
    fn index(&self) -> usize {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, size: u64) -> Result<DeviceMemory> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.memories.lock().insert(id, vec![0u8; size as usize]);
        Ok(DeviceMemory {
            device: self.index,
            id,
            size,
        })
    }

    fn release(&self, mem: DeviceMemory) {
        self.memories.lock().remove(&mem.id);
    }

    fn write(&self, mem: DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        self.check_failure("write")?;
        check_bounds(self.index, "write", &mem, offset, data.len() as u64)?;
        {
            let mut memories = self.memories.lock();
            let bytes = memories
                .get_mut(&mem.id)
                .ok_or_else(|| Error::device(self.index, "write", "unknown allocation"))?;
            let at = offset as usize;
            bytes[at..at + data.len()].copy_from_slice(data);
        }
        Self::simulate(self.cost_per_byte, data.len() as u64);
        Ok(())
    }

    fn read(&self, mem: DeviceMemory, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_failure("read")?;
        check_bounds(self.index, "read", &mem, offset, out.len() as u64)?;
        {
            let memories = self.memories.lock();
            let bytes = memories
                .get(&mem.id)
                .ok_or_else(|| Error::device(self.index, "read", "unknown allocation"))?;
            let at = offset as usize;
            out.copy_from_slice(&bytes[at..at + out.len()]);
        }
        Self::simulate(self.cost_per_byte, out.len() as u64);
        Ok(())
    }

    fn fill(&self, mem: DeviceMemory, range: Range<u64>, pattern: &[u8]) -> Result<()> {
        self.check_failure("fill")?;
        if pattern.is_empty() {
            return Err(Error::invalid("fill pattern is empty"));
        }
        check_bounds(self.index, "fill", &mem, range.start, range.end - range.start)?;
        let mut memories = self.memories.lock();
        let bytes = memories
            .get_mut(&mem.id)
            .ok_or_else(|| Error::device(self.index, "fill", "unknown allocation"))?;
        for (i, b) in bytes[range.start as usize..range.end as usize]
            .iter_mut()
            .enumerate()
        {
            *b = pattern[(range.start as usize + i) % pattern.len()];
        }
        Ok(())
    }

    fn launch(&self, body: &KernelBody, range: &NdRange, args: &[LaunchArg]) -> Result<()> {
        self.check_failure("launch")?;

        // move replicas out so the body can borrow each one mutably
        let mut taken: Vec<(u64, Vec<u8>)> = Vec::new();
        {
            let mut memories = self.memories.lock();
            for arg in args {
                if let LaunchArg::Buffer(mem) = arg {
                    match memories.remove(&mem.id) {
                        Some(bytes) => taken.push((mem.id, bytes)),
                        None => {
                            for (id, bytes) in taken.drain(..) {
                                memories.insert(id, bytes);
                            }
                            return Err(Error::device(
                                self.index,
                                "launch",
                                format!("allocation {} unknown or bound twice", mem.id),
                            ));
                        }
                    }
                }
            }
        }

        let result = {
            let mut slots = taken.iter_mut();
            let mut bound = Vec::with_capacity(args.len());
            for arg in args {
                match arg {
                    LaunchArg::Buffer(_) => {
                        if let Some((_, bytes)) = slots.next() {
                            bound.push(InvocationArg::Buffer(bytes.as_mut_slice()));
                        }
                    }
                    LaunchArg::Scalar(bytes) => bound.push(InvocationArg::Scalar(bytes)),
                }
            }
            let mut invocation = KernelInvocation::new(range, bound);
            body(&mut invocation)
        };

        {
            let mut memories = self.memories.lock();
            for (id, bytes) in taken {
                memories.insert(id, bytes);
            }
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        Self::simulate(self.cost_per_item, range.total_items());
        result.map_err(|e| Error::device(self.index, "launch", e.to_string()))
    }

    fn peer_group(&self) -> Option<u32> {
        self.peer_group
    }
}
