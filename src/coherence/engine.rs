//! Transfer planning for one kernel launch.
//!
//! `compute_transfers` only reads validity; `commit` applies the effects of
//! a plan once its commands have been handed to the device queues.

use super::buffer::{Buffer, BufferId, Location};
use super::IntervalSet;
use crate::device::Device;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace};

/// Associative reduction applied to combine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CombineOp {
    Or,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElemType {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElemType {
    pub fn size(self) -> u64 {
        match self {
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 | ElemType::F64 => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CombineWrite {
    pub buffer: Buffer,
    pub op: CombineOp,
    pub elem: ElemType,
    pub region: IntervalSet,
}

/// What one sub-kernel reads, writes and combine-writes.
#[derive(Debug, Clone, Default)]
pub struct AccessSet {
    pub required: Vec<(Buffer, IntervalSet)>,
    pub written: Vec<(Buffer, IntervalSet)>,
    pub combine: Vec<CombineWrite>,
}

fn merge_into(list: &mut Vec<(Buffer, IntervalSet)>, buffer: &Buffer, region: IntervalSet) {
    match list.iter_mut().find(|(b, _)| b.same(buffer)) {
        Some((_, existing)) => existing.union(&region),
        None => list.push((buffer.clone(), region)),
    }
}

impl AccessSet {
    pub fn require(&mut self, buffer: &Buffer, region: IntervalSet) {
        merge_into(&mut self.required, buffer, region);
    }

    pub fn write(&mut self, buffer: &Buffer, region: IntervalSet) {
        merge_into(&mut self.written, buffer, region);
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.written.is_empty() && self.combine.is_empty()
    }

    /// Bytes moved into a device to satisfy `required`, given current validity.
    pub fn missing_bytes(&self, device: usize) -> u64 {
        self.required
            .iter()
            .map(|(b, r)| r.difference(b.state().device_valid(device)).covered_size())
            .sum()
    }
}

/// Accesses of the sub-kernel that will run on `device`.
#[derive(Debug, Clone)]
pub struct DeviceAccess {
    pub device: usize,
    pub access: AccessSet,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub buffer: Buffer,
    pub device: usize,
    pub range: Range<u64>,
}

impl Transfer {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PeerTransfer {
    pub buffer: Buffer,
    pub src: usize,
    pub dst: usize,
    pub range: Range<u64>,
}

/// One device's partial result of a combine write, read back after the kernel.
#[derive(Debug, Clone)]
pub struct CombineTransfer {
    pub buffer: Buffer,
    pub device: usize,
    pub op: CombineOp,
    pub elem: ElemType,
    pub range: Range<u64>,
}

/// Everything that must move for one launch.
///
/// `d2h` and `d2d` happen before the kernels (staging), `h2d` after `d2h`,
/// `combine_d2h` after the kernels, followed by the host reduction.
#[derive(Debug, Clone, Default)]
pub struct TransferPlan {
    pub h2d: Vec<Transfer>,
    pub d2h: Vec<Transfer>,
    pub d2d: Vec<PeerTransfer>,
    pub combine_d2h: Vec<CombineTransfer>,
    accesses: Vec<DeviceAccess>,
}

impl TransferPlan {
    pub fn is_empty(&self) -> bool {
        self.h2d.is_empty()
            && self.d2h.is_empty()
            && self.d2d.is_empty()
            && self.combine_d2h.is_empty()
    }

    pub fn combine_of(&self, op: CombineOp) -> impl Iterator<Item = &CombineTransfer> {
        self.combine_d2h.iter().filter(move |t| t.op == op)
    }

    pub fn h2d_bytes(&self, device: usize) -> u64 {
        self.h2d
            .iter()
            .filter(|t| t.device == device)
            .map(Transfer::len)
            .sum::<u64>()
            + self
                .d2d
                .iter()
                .filter(|t| t.dst == device)
                .map(|t| t.range.end - t.range.start)
                .sum::<u64>()
    }

    pub fn d2h_bytes(&self, device: usize) -> u64 {
        self.d2h
            .iter()
            .filter(|t| t.device == device)
            .map(Transfer::len)
            .sum::<u64>()
            + self
                .combine_d2h
                .iter()
                .filter(|t| t.device == device)
                .map(|t| t.range.end - t.range.start)
                .sum::<u64>()
    }

    pub fn accesses(&self) -> &[DeviceAccess] {
        &self.accesses
    }

    /// Distinct buffers with combine writes, each with its transfers.
    pub fn combine_groups(&self) -> Vec<(Buffer, Vec<CombineTransfer>)> {
        let mut groups: Vec<(Buffer, Vec<CombineTransfer>)> = Vec::new();
        for t in &self.combine_d2h {
            match groups.iter_mut().find(|(b, _)| b.same(&t.buffer)) {
                Some((_, list)) => list.push(t.clone()),
                None => groups.push((t.buffer.clone(), vec![t.clone()])),
            }
        }
        groups
    }
}

#[derive(Debug)]
pub struct CoherenceEngine {
    devices: Vec<Arc<dyn Device>>,
    direct_peer_copy: bool,
}

#[derive(Default)]
struct Staging {
    host: HashMap<BufferId, IntervalSet>,
    device: HashMap<(BufferId, usize), IntervalSet>,
}

impl CoherenceEngine {
    pub fn new(devices: Vec<Arc<dyn Device>>, direct_peer_copy: bool) -> Self {
        Self {
            devices,
            direct_peer_copy,
        }
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    fn peer_path(&self, src: usize, dst: usize) -> bool {
        self.direct_peer_copy && self.devices[src].supports_peer(self.devices[dst].as_ref())
    }

    /// Plans the transfers that make every required region valid on its
    /// device and collects the partial results of combine writes.
    pub fn compute_transfers(&self, accesses: Vec<DeviceAccess>) -> Result<TransferPlan> {
        for access in &accesses {
            if access.device >= self.devices.len() {
                return Err(Error::invalid(format!("no device {}", access.device)));
            }
        }
        check_combine_conflicts(&accesses)?;

        let mut plan = TransferPlan::default();
        let mut staging = Staging::default();

        for access in &accesses {
            let device = access.device;
            for (buffer, region) in &access.access.required {
                self.plan_required(&mut plan, &mut staging, buffer, device, region)?;
            }
        }

        for access in &accesses {
            for cw in &access.access.combine {
                let size = cw.elem.size();
                for r in cw.region.iter() {
                    if r.start % size != 0 || r.end % size != 0 {
                        return Err(Error::coherence(format!(
                            "combine region {}..{} not aligned to {}-byte elements",
                            r.start, r.end, size
                        )));
                    }
                }
                // the host keeps the pre-kernel value as the reduction base
                self.plan_host_copy(&mut plan, &mut staging, &cw.buffer, &cw.region)?;
                for r in cw.region.iter() {
                    plan.combine_d2h.push(CombineTransfer {
                        buffer: cw.buffer.clone(),
                        device: access.device,
                        op: cw.op,
                        elem: cw.elem,
                        range: r.clone(),
                    });
                }
            }
        }

        debug!(
            h2d = plan.h2d.len(),
            d2h = plan.d2h.len(),
            d2d = plan.d2d.len(),
            combine = plan.combine_d2h.len(),
            "computed transfer plan"
        );
        plan.accesses = accesses;
        Ok(plan)
    }

    fn plan_required(
        &self,
        plan: &mut TransferPlan,
        staging: &mut Staging,
        buffer: &Buffer,
        device: usize,
        region: &IntervalSet,
    ) -> Result<()> {
        let key = (buffer.id(), device);
        let (mut missing, host_valid, others, last_writer) = {
            let state = buffer.state();
            let mut have = state.device_valid(device).clone();
            if let Some(planned) = staging.device.get(&key) {
                have.union(planned);
            }
            let mut host_valid = state.host_valid().clone();
            if let Some(planned) = staging.host.get(&buffer.id()) {
                host_valid.union(planned);
            }
            let others: Vec<(usize, IntervalSet)> = (0..self.devices.len())
                .filter(|&d| d != device)
                .map(|d| (d, state.device_valid(d).clone()))
                .collect();
            (region.difference(&have), host_valid, others, state.last_writer())
        };
        if missing.is_empty() {
            return Ok(());
        }

        let from_host = missing.intersection(&host_valid);
        for r in from_host.iter() {
            plan.h2d.push(Transfer {
                buffer: buffer.clone(),
                device,
                range: r.clone(),
            });
        }
        missing = missing.difference(&from_host);

        // most recent writer first, then the others in device order
        let mut sources = others;
        if let Some(Location::Device(w)) = last_writer {
            sources.sort_by_key(|(d, _)| if *d == w { 0 } else { 1 });
        }

        for (src, valid) in sources {
            if missing.is_empty() {
                break;
            }
            let part = missing.intersection(&valid);
            if part.is_empty() {
                continue;
            }
            if self.peer_path(src, device) {
                for r in part.iter() {
                    plan.d2d.push(PeerTransfer {
                        buffer: buffer.clone(),
                        src,
                        dst: device,
                        range: r.clone(),
                    });
                }
            } else {
                let host = staging.host.entry(buffer.id()).or_default();
                for r in part.difference(host).iter() {
                    plan.d2h.push(Transfer {
                        buffer: buffer.clone(),
                        device: src,
                        range: r.clone(),
                    });
                }
                host.union(&part);
                for r in part.iter() {
                    plan.h2d.push(Transfer {
                        buffer: buffer.clone(),
                        device,
                        range: r.clone(),
                    });
                }
            }
            trace!(buffer = ?buffer.id(), src, dst = device, bytes = part.covered_size(), "device-to-device refresh");
            missing = missing.difference(&part);
        }

        if !missing.is_empty() {
            return Err(Error::coherence(format!(
                "bytes {:?} of buffer {:?} are valid nowhere",
                missing,
                buffer.id()
            )));
        }

        staging.device.entry(key).or_default().union(region);
        Ok(())
    }

    /// Stages `region` of `buffer` into the host shadow if it is not valid there.
    fn plan_host_copy(
        &self,
        plan: &mut TransferPlan,
        staging: &mut Staging,
        buffer: &Buffer,
        region: &IntervalSet,
    ) -> Result<()> {
        let mut missing = {
            let state = buffer.state();
            let mut host_valid = state.host_valid().clone();
            if let Some(planned) = staging.host.get(&buffer.id()) {
                host_valid.union(planned);
            }
            region.difference(&host_valid)
        };
        if missing.is_empty() {
            return Ok(());
        }

        let sources: Vec<(usize, IntervalSet)> = {
            let state = buffer.state();
            (0..self.devices.len())
                .map(|d| (d, state.device_valid(d).clone()))
                .collect()
        };
        let host = staging.host.entry(buffer.id()).or_default();
        for (src, valid) in sources {
            let part = missing.intersection(&valid);
            for r in part.iter() {
                plan.d2h.push(Transfer {
                    buffer: buffer.clone(),
                    device: src,
                    range: r.clone(),
                });
            }
            host.union(&part);
            missing = missing.difference(&part);
            if missing.is_empty() {
                return Ok(());
            }
        }
        Err(Error::coherence(format!(
            "bytes {:?} of buffer {:?} are valid nowhere",
            missing,
            buffer.id()
        )))
    }

    /// Records the validity a submitted plan produces.
    pub fn commit(&self, plan: &TransferPlan) {
        for t in &plan.d2h {
            t.buffer
                .state()
                .mark_valid(Location::Host, &IntervalSet::from_range(t.range.clone()));
        }
        for t in &plan.h2d {
            t.buffer
                .state()
                .mark_valid(Location::Device(t.device), &IntervalSet::from_range(t.range.clone()));
        }
        for t in &plan.d2d {
            t.buffer
                .state()
                .mark_valid(Location::Device(t.dst), &IntervalSet::from_range(t.range.clone()));
        }

        for access in &plan.accesses {
            for (buffer, region) in &access.access.written {
                buffer
                    .state()
                    .set_exclusive(Location::Device(access.device), region);
            }
        }

        // combine results only exist on the host once reduced
        for (buffer, transfers) in plan.combine_groups() {
            let region: IntervalSet = transfers.iter().map(|t| t.range.clone()).collect();
            buffer.state().set_exclusive(Location::Host, &region);
        }
    }

    /// Transfers that make `range` of `buffer` valid in the host shadow.
    pub fn host_transfers(&self, buffer: &Buffer, range: Range<u64>) -> Result<Vec<Transfer>> {
        buffer.check_range(&range)?;
        let mut plan = TransferPlan::default();
        let mut staging = Staging::default();
        self.plan_host_copy(&mut plan, &mut staging, buffer, &IntervalSet::from_range(range))?;
        Ok(plan.d2h)
    }

    /// Marks completed host staging transfers valid.
    pub fn commit_host(&self, transfers: &[Transfer]) {
        for t in transfers {
            t.buffer
                .state()
                .mark_valid(Location::Host, &IntervalSet::from_range(t.range.clone()));
        }
    }

    /// The host wrote `range`; device copies of it are stale.
    pub fn host_wrote(&self, buffer: &Buffer, range: Range<u64>) {
        buffer
            .state()
            .set_exclusive(Location::Host, &IntervalSet::from_range(range));
    }
}

fn check_combine_conflicts(accesses: &[DeviceAccess]) -> Result<()> {
    for (i, a) in accesses.iter().enumerate() {
        for cw in &a.access.combine {
            for b in accesses.iter().skip(i + 1) {
                if b.device == a.device {
                    continue;
                }
                for other in &b.access.combine {
                    if other.buffer.same(&cw.buffer)
                        && (other.op != cw.op || other.elem != cw.elem)
                        && cw.region.overlaps(&other.region)
                    {
                        return Err(Error::coherence(format!(
                            "devices {} and {} combine-write overlapping bytes of {:?} with different reductions",
                            a.device,
                            b.device,
                            cw.buffer.id()
                        )));
                    }
                }
            }
            for b in accesses.iter().filter(|b| b.device != a.device) {
                for (buffer, region) in &b.access.written {
                    if buffer.same(&cw.buffer) && cw.region.overlaps(region) {
                        return Err(Error::coherence(format!(
                            "device {} plain-writes bytes device {} combine-writes in {:?}",
                            b.device,
                            a.device,
                            cw.buffer.id()
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

trait CombineElem: Copy + PartialOrd {
    const WIDTH: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
    /// `self + (part - base)`, wrapping for integers.
    fn add_delta(self, base: Self, part: Self) -> Self;
}

macro_rules! impl_int_elem {
    ($($ty:ty),*) => {$(
        impl CombineElem for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }
            fn add_delta(self, base: Self, part: Self) -> Self {
                self.wrapping_add(part.wrapping_sub(base))
            }
        }
    )*};
}

macro_rules! impl_float_elem {
    ($($ty:ty),*) => {$(
        impl CombineElem for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }
            fn add_delta(self, base: Self, part: Self) -> Self {
                self + (part - base)
            }
        }
    )*};
}

impl_int_elem!(i32, u32, i64, u64);
impl_float_elem!(f32, f64);

fn combine_typed<T: CombineElem>(op: CombineOp, shadow: &mut [u8], base: &[u8], partial: &[u8]) {
    let chunks = shadow
        .chunks_exact_mut(T::WIDTH)
        .zip(base.chunks_exact(T::WIDTH))
        .zip(partial.chunks_exact(T::WIDTH));
    for ((out, base), part) in chunks {
        let cur = T::load(out);
        let part = T::load(part);
        let next = match op {
            CombineOp::Sum => cur.add_delta(T::load(base), part),
            CombineOp::Min if part < cur => part,
            CombineOp::Max if part > cur => part,
            _ => cur,
        };
        next.store(out);
    }
}

/// Folds one device's partial copy into the host shadow.
///
/// `shadow` starts out equal to `base` (the pre-kernel value); applying every
/// partial in any order yields `base + Σ(partial − base)` for sums and the
/// element-wise min / max / or for the others.
pub fn apply_combine(
    op: CombineOp,
    elem: ElemType,
    shadow: &mut [u8],
    base: &[u8],
    partial: &[u8],
) -> Result<()> {
    if shadow.len() != base.len() || shadow.len() != partial.len() {
        return Err(Error::coherence("combine slices differ in length"));
    }
    if shadow.len() as u64 % elem.size() != 0 {
        return Err(Error::coherence("combine slice is not a whole number of elements"));
    }

    if op == CombineOp::Or {
        for (out, p) in shadow.iter_mut().zip(partial) {
            *out |= *p;
        }
        return Ok(());
    }

    match elem {
        ElemType::I32 => combine_typed::<i32>(op, shadow, base, partial),
        ElemType::U32 => combine_typed::<u32>(op, shadow, base, partial),
        ElemType::I64 => combine_typed::<i64>(op, shadow, base, partial),
        ElemType::U64 => combine_typed::<u64>(op, shadow, base, partial),
        ElemType::F32 => combine_typed::<f32>(op, shadow, base, partial),
        ElemType::F64 => combine_typed::<f64>(op, shadow, base, partial),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::BufferFlags;
    use crate::device::HostDevice;

    fn setup(n: usize, direct: bool) -> (CoherenceEngine, Vec<Arc<dyn Device>>) {
        let devs: Vec<Arc<dyn Device>> = (0..n)
            .map(|i| Arc::new(HostDevice::builder(i).peer_group(0).build()) as Arc<dyn Device>)
            .collect();
        (CoherenceEngine::new(devs.clone(), direct), devs)
    }

    fn access(device: usize, f: impl FnOnce(&mut AccessSet)) -> DeviceAccess {
        let mut set = AccessSet::default();
        f(&mut set);
        DeviceAccess {
            device,
            access: set,
        }
    }

    #[test]
    fn test_first_launch_moves_from_host() {
        let (engine, devs) = setup(2, false);
        let buf = Buffer::new(&devs, 100, BufferFlags::NONE, None).unwrap();
        let plan = engine
            .compute_transfers(vec![
                access(0, |s| s.require(&buf, IntervalSet::from_range(0..50))),
                access(1, |s| s.require(&buf, IntervalSet::from_range(50..100))),
            ])
            .unwrap();
        assert_eq!(plan.h2d.len(), 2);
        assert!(plan.d2h.is_empty());
        assert_eq!(plan.h2d_bytes(0), 50);
        engine.commit(&plan);
        assert_eq!(buf.state().device_valid(1).ranges(), &[50..100]);

        // nothing left to move the second time
        let again = engine
            .compute_transfers(vec![access(0, |s| {
                s.require(&buf, IntervalSet::from_range(10..40))
            })])
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_write_then_read_elsewhere_stages_through_host() {
        let (engine, devs) = setup(2, false);
        let buf = Buffer::new(&devs, 64, BufferFlags::NONE, None).unwrap();
        let plan = engine
            .compute_transfers(vec![access(0, |s| s.write(&buf, IntervalSet::from_range(0..64)))])
            .unwrap();
        engine.commit(&plan);
        assert!(buf.state().host_valid().is_empty());

        let plan = engine
            .compute_transfers(vec![access(1, |s| {
                s.require(&buf, IntervalSet::from_range(16..32))
            })])
            .unwrap();
        assert_eq!(plan.d2h.len(), 1);
        assert_eq!(plan.d2h[0].device, 0);
        assert_eq!(plan.d2h[0].range, 16..32);
        assert_eq!(plan.h2d.len(), 1);
        assert_eq!(plan.h2d[0].device, 1);
        engine.commit(&plan);
        let state = buf.state();
        assert_eq!(state.host_valid().ranges(), &[16..32]);
        assert_eq!(state.device_valid(1).ranges(), &[16..32]);
    }

    #[test]
    fn test_direct_peer_path() {
        let (engine, devs) = setup(2, true);
        let buf = Buffer::new(&devs, 64, BufferFlags::NONE, None).unwrap();
        let plan = engine
            .compute_transfers(vec![access(0, |s| s.write(&buf, IntervalSet::from_range(0..64)))])
            .unwrap();
        engine.commit(&plan);
        let plan = engine
            .compute_transfers(vec![access(1, |s| {
                s.require(&buf, IntervalSet::from_range(0..8))
            })])
            .unwrap();
        assert_eq!(plan.d2d.len(), 1);
        assert!(plan.d2h.is_empty() && plan.h2d.is_empty());
    }

    #[test]
    fn test_disjoint_sum_writers_both_read_back() {
        let (engine, devs) = setup(2, false);
        let buf = Buffer::new(&devs, 32, BufferFlags::NONE, None).unwrap();
        let cw = |range: Range<u64>| CombineWrite {
            buffer: buf.clone(),
            op: CombineOp::Sum,
            elem: ElemType::U32,
            region: IntervalSet::from_range(range),
        };
        let plan = engine
            .compute_transfers(vec![
                access(0, |s| s.combine.push(cw(0..16))),
                access(1, |s| s.combine.push(cw(16..32))),
            ])
            .unwrap();
        let sums: Vec<_> = plan.combine_of(CombineOp::Sum).collect();
        assert_eq!(sums.len(), 2);
        assert!(sums.iter().any(|t| t.device == 0 && t.range == (0..16)));
        assert!(sums.iter().any(|t| t.device == 1 && t.range == (16..32)));
        engine.commit(&plan);
        assert_eq!(buf.state().host_valid().covered_size(), 32);
        assert!(buf.state().device_valid(0).is_empty());
    }

    #[test]
    fn test_conflicting_combines_flagged() {
        let (engine, devs) = setup(2, false);
        let buf = Buffer::new(&devs, 32, BufferFlags::NONE, None).unwrap();
        let plan = engine.compute_transfers(vec![
            access(0, |s| {
                s.combine.push(CombineWrite {
                    buffer: buf.clone(),
                    op: CombineOp::Sum,
                    elem: ElemType::U32,
                    region: IntervalSet::from_range(0..16),
                })
            }),
            access(1, |s| {
                s.combine.push(CombineWrite {
                    buffer: buf.clone(),
                    op: CombineOp::Max,
                    elem: ElemType::U32,
                    region: IntervalSet::from_range(8..24),
                })
            }),
        ]);
        assert!(matches!(plan, Err(Error::Coherence(_))));
    }

    #[test]
    fn test_apply_combine_sum_and_max() {
        let base: Vec<u8> = [10u32, 10].iter().flat_map(|v| v.to_le_bytes()).collect();
        let p0: Vec<u8> = [13u32, 10].iter().flat_map(|v| v.to_le_bytes()).collect();
        let p1: Vec<u8> = [11u32, 15].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut shadow = base.clone();
        apply_combine(CombineOp::Sum, ElemType::U32, &mut shadow, &base, &p0).unwrap();
        apply_combine(CombineOp::Sum, ElemType::U32, &mut shadow, &base, &p1).unwrap();
        assert_eq!(u32::from_le_bytes(shadow[0..4].try_into().unwrap()), 14);
        assert_eq!(u32::from_le_bytes(shadow[4..8].try_into().unwrap()), 15);

        let mut shadow = base.clone();
        apply_combine(CombineOp::Max, ElemType::U32, &mut shadow, &base, &p0).unwrap();
        apply_combine(CombineOp::Max, ElemType::U32, &mut shadow, &base, &p1).unwrap();
        assert_eq!(u32::from_le_bytes(shadow[0..4].try_into().unwrap()), 13);
        assert_eq!(u32::from_le_bytes(shadow[4..8].try_into().unwrap()), 15);
    }

    #[test]
    fn test_apply_combine_f32_sum_and_or() {
        let base: Vec<u8> = 1.0f32.to_le_bytes().to_vec();
        let p0 = 3.5f32.to_le_bytes().to_vec();
        let p1 = 2.0f32.to_le_bytes().to_vec();
        let mut shadow = base.clone();
        apply_combine(CombineOp::Sum, ElemType::F32, &mut shadow, &base, &p0).unwrap();
        apply_combine(CombineOp::Sum, ElemType::F32, &mut shadow, &base, &p1).unwrap();
        assert_eq!(f32::from_le_bytes(shadow[..].try_into().unwrap()), 4.5);

        let mut flags = vec![0u8, 1, 0, 0];
        apply_combine(CombineOp::Or, ElemType::U32, &mut flags, &[0, 1, 0, 0], &[4, 0, 0, 0])
            .unwrap();
        assert_eq!(flags, vec![4, 1, 0, 0]);
    }
}
