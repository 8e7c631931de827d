//! The logical device.
//!
//! A [`Context`] owns one queue per physical device, the scheduler that
//! splits launches, and the coherence engine that keeps buffer replicas in
//! step with the host shadow. Every cross-queue dependency is expressed as
//! an event wait-list; nothing here blocks on a device except the explicitly
//! synchronous host operations.

use crate::coherence::{
    apply_combine, Buffer, BufferFlags, CoherenceEngine, CombineTransfer, DeviceAccess,
    HostShadow, IntervalSet, Location,
};
use crate::config::Config;
use crate::device::{Device, LaunchArg};
use crate::error::{Error, OrExit, Result};
use crate::kernel::{Kernel, KernelAnalysis, KernelArg, KernelBody, NdRange};
use crate::queue::{wait_all, CommandKind, DeviceQueue, Event, HostFn, Scratch};
use crate::scheduler::{self, Scheduler};
use crate::telemetry::MetricsSnapshot;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct Context {
    devices: Vec<Arc<dyn Device>>,
    queues: Vec<DeviceQueue>,
    scheduler: Box<dyn Scheduler>,
    engine: CoherenceEngine,
    config: Config,
    // planning and committing a launch must not interleave with another
    submit: Mutex<()>,
}

impl Context {
    /// Builds a context over `available`, narrowed to `config.devices` when
    /// a selection list is given.
    pub fn new(available: Vec<Arc<dyn Device>>, config: Config) -> Result<Self> {
        config.validate()?;

        let devices: Vec<Arc<dyn Device>> = match &config.devices {
            Some(selection) => selection
                .iter()
                .map(|&id| {
                    available.get(id).cloned().ok_or_else(|| {
                        Error::config(format!(
                            "selected device {} but only {} are available",
                            id,
                            available.len()
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            None => available,
        };
        if devices.is_empty() {
            return Err(Error::config("no devices to aggregate"));
        }

        let queues = devices
            .iter()
            .enumerate()
            .map(|(position, device)| DeviceQueue::new(position, device.clone(), &config))
            .collect::<Result<Vec<_>>>()?;
        let scheduler = scheduler::from_config(&config, devices.len())?;
        let engine = CoherenceEngine::new(devices.clone(), config.direct_peer_copy);

        debug!(
            devices = devices.len(),
            scheduler = scheduler.name(),
            "context created"
        );

        Ok(Self {
            devices,
            queues,
            scheduler,
            engine,
            config,
            submit: Mutex::new(()),
        })
    }

    /// Reads the configuration from the environment. Configuration errors
    /// terminate the process.
    pub fn from_env(available: Vec<Arc<dyn Device>>) -> Result<Self> {
        let config = Config::from_env().or_exit()?;
        Self::new(available, config).or_exit()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn queue(&self, position: usize) -> Option<&DeviceQueue> {
        self.queues.get(position)
    }

    pub fn metrics(&self) -> Vec<MetricsSnapshot> {
        self.queues.iter().map(|q| q.metrics().snapshot()).collect()
    }

    /// Allocates a logical buffer with a replica on every device. Host data
    /// is copied into the shadow.
    pub fn create_buffer(
        &self,
        size: u64,
        flags: BufferFlags,
        host_data: Option<&[u8]>,
    ) -> Result<Buffer> {
        Buffer::new(&self.devices, size, flags, host_data.map(<[u8]>::to_vec))
    }

    /// Like [`create_buffer`](Self::create_buffer) with caller-owned bytes.
    /// With host-copy elision the shadow adopts `data` as is.
    pub fn create_buffer_from_vec(&self, flags: BufferFlags, data: Vec<u8>) -> Result<Buffer> {
        let flags = flags | BufferFlags::USE_HOST_PTR;
        let data = if self.config.host_copy_elision {
            data
        } else {
            data.as_slice().to_vec()
        };
        Buffer::new(&self.devices, data.len() as u64, flags, Some(data))
    }

    pub fn create_kernel<S: Into<String>>(
        &self,
        name: S,
        analysis: Arc<dyn KernelAnalysis>,
        body: KernelBody,
    ) -> Kernel {
        Kernel::new(name, analysis, body)
    }

    /// Partitions `range` across the devices and enqueues the transfers,
    /// sub-kernels and combine reductions it needs.
    ///
    /// The returned event completes once every sub-kernel and every
    /// reduction of this launch has.
    pub fn enqueue_nd_range_kernel(&self, kernel: &Kernel, range: &NdRange) -> Result<Event> {
        let args = kernel.bound_args()?;
        let _submit = self.submit.lock();

        let partition = self.scheduler.get_partition(kernel, &args, range)?;
        let accesses = partition
            .subkernels
            .iter()
            .map(|s| DeviceAccess {
                device: s.device,
                access: s.access.clone(),
            })
            .collect();
        let plan = self.engine.compute_transfers(accesses)?;

        let mut h2d_events: Vec<(usize, Event)> = Vec::new();
        let mut d2h_events: Vec<(usize, Event)> = Vec::new();
        let mut exec_waits: Vec<Vec<Event>> = vec![Vec::new(); self.devices.len()];

        // staging into the shadow first so the uploads below can wait on it
        for t in &plan.d2h {
            let wait = t.buffer.state().shadow_sync().before_write();
            let event = self.queues[t.device].enqueue(
                CommandKind::Read {
                    buffer: t.buffer.clone(),
                    range: t.range.clone(),
                },
                wait,
            )?;
            t.buffer.state().shadow_sync().record_fill(event.clone());
            d2h_events.push((t.device, event));
        }

        for t in &plan.h2d {
            let wait = t.buffer.state().shadow_sync().before_read();
            let event = self.queues[t.device].enqueue(
                CommandKind::Write {
                    buffer: t.buffer.clone(),
                    range: t.range.clone(),
                },
                wait,
            )?;
            t.buffer.state().shadow_sync().record_read(event.clone());
            h2d_events.push((t.device, event));
        }

        for t in &plan.d2d {
            let wait: Vec<Event> = self.queues[t.dst].last_event().into_iter().collect();
            let event = self.queues[t.src].enqueue(
                CommandKind::Copy {
                    buffer: t.buffer.clone(),
                    dst: t.dst,
                    dst_device: self.devices[t.dst].clone(),
                    range: t.range.clone(),
                },
                wait,
            )?;
            exec_waits[t.dst].push(event.clone());
            h2d_events.push((t.dst, event));
        }

        let mut kernel_events: Vec<(usize, Event)> = Vec::with_capacity(partition.subkernels.len());
        for sub in &partition.subkernels {
            let launch_args = args
                .iter()
                .map(|arg| match arg {
                    KernelArg::Buffer(b) => LaunchArg::Buffer(b.replica(sub.device)),
                    KernelArg::Scalar(bytes) => LaunchArg::Scalar(bytes.clone()),
                })
                .collect();
            let wait = std::mem::take(&mut exec_waits[sub.device]);
            let event = self.queues[sub.device].enqueue(
                CommandKind::Exec {
                    kernel: kernel.name().to_string(),
                    body: kernel.body().clone(),
                    range: sub.range.clone(),
                    args: launch_args,
                },
                wait,
            )?;
            kernel_events.push((sub.device, event));
        }

        let mut done: Vec<Event> = kernel_events.iter().map(|(_, e)| e.clone()).collect();
        for (buffer, transfers) in plan.combine_groups() {
            let reduced = self.enqueue_reduction(&buffer, &transfers, &mut d2h_events)?;
            done.push(reduced);
        }

        self.engine.commit(&plan);

        debug!(
            kernel = kernel.name(),
            subkernels = partition.subkernels.len(),
            h2d = h2d_events.len(),
            d2h = d2h_events.len(),
            need_sync = partition.need_sync,
            "launch enqueued"
        );

        self.scheduler.set_h2d_events(kernel, h2d_events);
        self.scheduler.set_kernel_events(kernel, kernel_events);
        self.scheduler.set_d2h_events(kernel, d2h_events);

        let anchor = partition.subkernels.first().map(|s| s.device).unwrap_or(0);
        let completion = self.queues[anchor].enqueue(CommandKind::Marker, done)?;

        if partition.need_sync {
            completion.wait()?;
        }
        Ok(completion)
    }

    /// Reads every partial copy back and folds them into the shadow with
    /// the base-delta rule. Returns the event of the reduction.
    fn enqueue_reduction(
        &self,
        buffer: &Buffer,
        transfers: &[CombineTransfer],
        d2h_events: &mut Vec<(usize, Event)>,
    ) -> Result<Event> {
        let mut wait = Vec::with_capacity(transfers.len());
        let mut partials: Vec<(CombineTransfer, Scratch)> = Vec::with_capacity(transfers.len());
        for t in transfers {
            let out: Scratch = Arc::new(Mutex::new(Vec::new()));
            let event = self.queues[t.device].enqueue(
                CommandKind::ReadInto {
                    buffer: buffer.clone(),
                    range: t.range.clone(),
                    out: out.clone(),
                },
                Vec::new(),
            )?;
            d2h_events.push((t.device, event.clone()));
            wait.push(event);
            partials.push((t.clone(), out));
        }
        wait.extend(buffer.state().shadow_sync().before_write());

        let anchor = transfers.first().map(|t| t.device).unwrap_or(0);
        let shadow = buffer.shadow().clone();
        let reduce: HostFn = Box::new(move || reduce_partials(&shadow, &partials));
        let event = self.queues[anchor].enqueue(CommandKind::HostFn(reduce), wait)?;
        buffer.state().shadow_sync().record_fill(event.clone());
        trace!(buffer = ?buffer.id(), partials = transfers.len(), "combine reduction enqueued");
        Ok(event)
    }

    /// Copies `data` into the shadow at `offset`. The host copy is complete
    /// when this returns; device replicas of the range become stale.
    pub fn enqueue_write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<Event> {
        let range = span(offset, data.len() as u64)?;
        buffer.check_range(&range)?;
        let _submit = self.submit.lock();

        self.wait_shadow_idle(buffer)?;
        buffer.shadow().write()[range.start as usize..range.end as usize].copy_from_slice(data);
        self.engine.host_wrote(buffer, range);
        Ok(Event::completed())
    }

    /// Owned variant of [`enqueue_write_buffer`](Self::enqueue_write_buffer).
    /// A write covering the whole buffer replaces the shadow instead of
    /// copying when host-copy elision is on.
    pub fn enqueue_write_buffer_owned(
        &self,
        buffer: &Buffer,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Event> {
        let whole = offset == 0 && data.len() as u64 == buffer.size();
        if !(whole && self.config.host_copy_elision) {
            return self.enqueue_write_buffer(buffer, offset, &data);
        }
        let _submit = self.submit.lock();
        self.wait_shadow_idle(buffer)?;
        buffer.shadow().replace(data);
        self.engine.host_wrote(buffer, 0..buffer.size());
        Ok(Event::completed())
    }

    fn wait_shadow_idle(&self, buffer: &Buffer) -> Result<()> {
        let pending = buffer.state().shadow_sync().before_write();
        wait_all(&pending)
    }

    /// Stages `len` bytes at `offset` into the shadow, then snapshots them in
    /// queue order. Later host writes wait for the snapshot.
    pub fn enqueue_read_buffer(&self, buffer: &Buffer, offset: u64, len: u64) -> Result<PendingRead> {
        let range = span(offset, len)?;
        buffer.check_range(&range)?;
        let _submit = self.submit.lock();

        let transfers = self.engine.host_transfers(buffer, range.clone())?;
        let mut events = buffer.state().shadow_sync().before_read();
        let anchor = transfers.first().map(|t| t.device).unwrap_or(0);
        for t in &transfers {
            let wait = t.buffer.state().shadow_sync().before_write();
            let event = self.queues[t.device].enqueue(
                CommandKind::Read {
                    buffer: t.buffer.clone(),
                    range: t.range.clone(),
                },
                wait,
            )?;
            t.buffer.state().shadow_sync().record_fill(event.clone());
            events.push(event);
        }
        self.engine.commit_host(&transfers);

        let out: Scratch = Arc::new(Mutex::new(Vec::new()));
        let snapshot: HostFn = {
            let shadow = buffer.shadow().clone();
            let out = out.clone();
            let (start, end) = (range.start as usize, range.end as usize);
            Box::new(move || {
                *out.lock() = shadow.read()[start..end].to_vec();
                Ok(())
            })
        };
        let event = self.queues[anchor].enqueue(CommandKind::HostFn(snapshot), events)?;
        buffer.state().shadow_sync().record_read(event.clone());

        Ok(PendingRead {
            len: len as usize,
            out,
            event,
        })
    }

    /// Blocking read into `out`.
    pub fn read_buffer(&self, buffer: &Buffer, offset: u64, out: &mut [u8]) -> Result<()> {
        self.enqueue_read_buffer(buffer, offset, out.len() as u64)?
            .wait_into(out)
    }

    /// Copies between logical buffers through the host shadow.
    pub fn enqueue_copy_buffer(
        &self,
        src: &Buffer,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        len: u64,
    ) -> Result<Event> {
        let a = span(src_offset, len)?;
        let b = span(dst_offset, len)?;
        if src.same(dst) && a.start < b.end && b.start < a.end {
            return Err(Error::invalid("copy source and destination overlap"));
        }
        dst.check_range(&b)?;
        let data = self.enqueue_read_buffer(src, src_offset, len)?.wait()?;
        self.enqueue_write_buffer(dst, dst_offset, &data)
    }

    /// Repeats `pattern` over `len` bytes at `offset`, in the shadow and in
    /// every replica, which all end up valid.
    pub fn enqueue_fill_buffer(
        &self,
        buffer: &Buffer,
        pattern: &[u8],
        offset: u64,
        len: u64,
    ) -> Result<Event> {
        let p = pattern.len() as u64;
        let range = span(offset, len)?;
        if p == 0 || offset % p != 0 || len % p != 0 {
            return Err(Error::invalid(format!(
                "fill of {}..{} not aligned to a {}-byte pattern",
                range.start, range.end, p
            )));
        }
        buffer.check_range(&range)?;
        let _submit = self.submit.lock();

        self.wait_shadow_idle(buffer)?;
        {
            let mut shadow = buffer.shadow().write();
            for chunk in shadow[range.start as usize..range.end as usize].chunks_exact_mut(pattern.len()) {
                chunk.copy_from_slice(pattern);
            }
        }

        // a peer copy into a replica runs on its source's queue
        let outstanding: Vec<Event> = self.queues.iter().filter_map(|q| q.last_event()).collect();
        let mut fills = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            fills.push(queue.enqueue(
                CommandKind::Fill {
                    buffer: buffer.clone(),
                    range: range.clone(),
                    pattern: pattern.to_vec(),
                },
                outstanding.clone(),
            )?);
        }

        {
            let region = IntervalSet::from_range(range);
            let mut state = buffer.state();
            state.set_exclusive(Location::Host, &region);
            for d in 0..self.devices.len() {
                state.mark_valid(Location::Device(d), &region);
            }
        }

        self.queues[0].enqueue(CommandKind::Marker, fills)
    }

    /// Waits for everything enqueued on every device.
    pub fn finish(&self) -> Result<()> {
        let mut first_err = None;
        for queue in &self.queues {
            if let Err(err) = queue.finish() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drains and stops every device queue.
    pub fn shutdown(&self) {
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices.len())
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}

/// A device-to-host read in flight. The bytes are copied out of the shadow
/// when `event` completes, so commands enqueued after it cannot change them.
#[derive(Debug)]
pub struct PendingRead {
    len: usize,
    out: Scratch,
    event: Event,
}

impl PendingRead {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn is_complete(&self) -> bool {
        self.event.is_complete()
    }

    pub fn wait(self) -> Result<Vec<u8>> {
        self.event.wait()?;
        let bytes = std::mem::take(&mut *self.out.lock());
        Ok(bytes)
    }

    pub fn wait_into(self, out: &mut [u8]) -> Result<()> {
        if out.len() != self.len {
            return Err(Error::invalid(format!(
                "output of {} bytes for a {}-byte read",
                out.len(),
                self.len
            )));
        }
        self.event.wait()?;
        out.copy_from_slice(&self.out.lock());
        Ok(())
    }
}

fn span(offset: u64, len: u64) -> Result<Range<u64>> {
    offset
        .checked_add(len)
        .map(|end| offset..end)
        .ok_or_else(|| Error::invalid(format!("range at {} of {} bytes overflows", offset, len)))
}

fn reduce_partials(shadow: &HostShadow, partials: &[(CombineTransfer, Scratch)]) -> Result<()> {
    let lo = partials.iter().map(|(t, _)| t.range.start).min().unwrap_or(0) as usize;
    let hi = partials.iter().map(|(t, _)| t.range.end).max().unwrap_or(0) as usize;

    let mut bytes = shadow.write();
    let base = bytes[lo..hi].to_vec();
    for (t, scratch) in partials {
        let (start, end) = (t.range.start as usize, t.range.end as usize);
        let partial = scratch.lock();
        apply_combine(
            t.op,
            t.elem,
            &mut bytes[start..end],
            &base[start - lo..end - lo],
            &partial,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailureStrategy, SchedulerKind, StaticPartition};
    use crate::device::HostDevice;
    use crate::kernel::invocation::{load_f32, store_f32};
    use crate::kernel::{AffineAnalysis, ArgAccess, Footprint};

    fn devices(n: usize) -> Vec<Arc<dyn Device>> {
        (0..n)
            .map(|i| Arc::new(HostDevice::new(i)) as Arc<dyn Device>)
            .collect()
    }

    fn half_split() -> Config {
        Config::builder()
            .scheduler(SchedulerKind::Static)
            .static_partition(StaticPartition::parse("2 1 0 1 1").unwrap())
            .failure_strategy(FailureStrategy::Record)
            .build()
            .unwrap()
    }

    fn scale_kernel() -> Kernel {
        let f32s = Footprint::Linear {
            elem_size: 4,
            per_item: 1,
        };
        let analysis = AffineAnalysis::builder()
            .global(ArgAccess::ReadWrite, f32s)
            .scalar()
            .build();
        let body = crate::kernel::body(|inv| {
            let factor = inv.scalar_f32(1)?;
            let rows = inv.range().dim0();
            let data = inv.buffer(0)?;
            for i in rows {
                let i = i as usize;
                store_f32(data, i, load_f32(data, i) * factor);
            }
            Ok(())
        });
        Kernel::new("scale", Arc::new(analysis), body)
    }

    fn floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_selection_out_of_range() {
        let config = Config::builder().devices(vec![0, 3]).build().unwrap();
        assert!(matches!(
            Context::new(devices(2), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_launch_then_read_back() {
        let ctx = Context::new(devices(2), half_split()).unwrap();
        let input: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let buf = ctx
            .create_buffer(256, BufferFlags::COPY_HOST_PTR, Some(&floats(&input)))
            .unwrap();
        let kernel = scale_kernel();
        kernel.set_arg(0, KernelArg::Buffer(buf.clone())).unwrap();
        kernel.set_arg(1, KernelArg::scalar_f32(2.0)).unwrap();

        ctx.enqueue_nd_range_kernel(&kernel, &NdRange::linear(64))
            .unwrap()
            .wait()
            .unwrap();
        let out = ctx.enqueue_read_buffer(&buf, 0, 256).unwrap().wait().unwrap();
        let expected: Vec<f32> = input.iter().map(|v| v * 2.0).collect();
        assert_eq!(out, floats(&expected));
        assert!(buf.state().orphaned(256).is_empty());
    }

    #[test]
    fn test_fill_makes_every_copy_valid() {
        let ctx = Context::new(devices(3), Config::default()).unwrap();
        let buf = ctx.create_buffer(32, BufferFlags::NONE, None).unwrap();
        ctx.enqueue_fill_buffer(&buf, &[7, 9], 8, 16).unwrap().wait().unwrap();
        {
            let state = buf.state();
            for d in 0..3 {
                assert_eq!(state.device_valid(d).ranges(), &[8..24]);
            }
        }
        let mut out = vec![0u8; 32];
        ctx.read_buffer(&buf, 0, &mut out).unwrap();
        assert_eq!(&out[..8], &[0; 8]);
        assert_eq!(&out[8..12], &[7, 9, 7, 9]);
        assert!(ctx.enqueue_fill_buffer(&buf, &[1, 2, 3], 0, 8).is_err());
    }

    #[test]
    fn test_reduce_partials_applies_base_delta() {
        use crate::coherence::{CombineOp, ElemType};
        let dev: Arc<dyn Device> = Arc::new(HostDevice::new(0));
        let buf = Buffer::new(&[dev], 8, BufferFlags::NONE, None).unwrap();
        buf.shadow().write()[..4].copy_from_slice(&5u32.to_le_bytes());

        let partial = |device: usize, value: u32| {
            let t = CombineTransfer {
                buffer: buf.clone(),
                device,
                op: CombineOp::Sum,
                elem: ElemType::U32,
                range: 0..4,
            };
            let scratch: Scratch = Arc::new(Mutex::new(value.to_le_bytes().to_vec()));
            (t, scratch)
        };
        reduce_partials(buf.shadow(), &[partial(0, 8), partial(1, 6)]).unwrap();
        let bytes = buf.shadow().read();
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 5 + 3 + 1);
    }
}
