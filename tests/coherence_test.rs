use proptest::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use vdev::coherence::{AccessSet, CoherenceEngine, DeviceAccess, Location};
use vdev::device::{Device, HostDevice};
use vdev::prelude::*;

const SIZE: u64 = 256;

fn bitmap(set: &IntervalSet) -> Vec<bool> {
    let mut bits = vec![false; SIZE as usize];
    for r in set.iter() {
        for b in r.clone() {
            bits[b as usize] = true;
        }
    }
    bits
}

fn range_strategy() -> impl Strategy<Value = Range<u64>> {
    (0..SIZE, 0..SIZE).prop_map(|(a, b)| a.min(b)..a.max(b))
}

#[derive(Debug, Clone)]
enum Op {
    Add(Range<u64>),
    Remove(Range<u64>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        range_strategy().prop_map(Op::Add),
        range_strategy().prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn test_interval_set_matches_bitmap(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut set = IntervalSet::new();
        let mut bits = vec![false; SIZE as usize];
        for op in &ops {
            match op {
                Op::Add(r) => {
                    set.add(r.clone());
                    for b in r.clone() { bits[b as usize] = true; }
                }
                Op::Remove(r) => {
                    set.remove(r.clone());
                    for b in r.clone() { bits[b as usize] = false; }
                }
            }
            prop_assert!(set.is_canonical());
        }
        prop_assert_eq!(bitmap(&set), bits.clone());
        prop_assert_eq!(set.covered_size(), bits.iter().filter(|&&b| b).count() as u64);
    }

    #[test]
    fn test_set_algebra_matches_bitmap(
        a in prop::collection::vec(range_strategy(), 0..12),
        b in prop::collection::vec(range_strategy(), 0..12),
    ) {
        let sa: IntervalSet = a.into_iter().collect();
        let sb: IntervalSet = b.into_iter().collect();
        let (ba, bb) = (bitmap(&sa), bitmap(&sb));

        let diff = sa.difference(&sb);
        let inter = sa.intersection(&sb);
        let mut uni = sa.clone();
        uni.union(&sb);
        prop_assert!(diff.is_canonical() && inter.is_canonical() && uni.is_canonical());

        let expect = |f: fn(bool, bool) -> bool| -> Vec<bool> {
            ba.iter().zip(&bb).map(|(&x, &y)| f(x, y)).collect()
        };
        prop_assert_eq!(bitmap(&diff), expect(|x, y| x && !y));
        prop_assert_eq!(bitmap(&inter), expect(|x, y| x && y));
        prop_assert_eq!(bitmap(&uni), expect(|x, y| x || y));
        prop_assert_eq!(sa.overlaps(&sb), !inter.is_empty());
    }

    /// Each step one device reads one region and writes another. The plan
    /// moves exactly the bytes the device is missing and nothing is ever
    /// left without a valid copy.
    #[test]
    fn test_transfers_are_minimal_and_nothing_is_orphaned(
        steps in prop::collection::vec((0usize..3, range_strategy(), range_strategy()), 1..20),
        peer in any::<bool>(),
    ) {
        let devices: Vec<Arc<dyn Device>> = (0..3)
            .map(|i| Arc::new(HostDevice::builder(i).peer_group(0).build()) as Arc<dyn Device>)
            .collect();
        let engine = CoherenceEngine::new(devices.clone(), peer);
        let buf = Buffer::new(&devices, SIZE, BufferFlags::NONE, None).unwrap();

        for (device, read, write) in steps {
            let mut access = AccessSet::default();
            if !read.is_empty() {
                access.require(&buf, IntervalSet::from_range(read.clone()));
            }
            if !write.is_empty() {
                access.write(&buf, IntervalSet::from_range(write.clone()));
            }
            let missing = access.missing_bytes(device);

            let plan = engine
                .compute_transfers(vec![DeviceAccess { device, access }])
                .unwrap();
            prop_assert_eq!(plan.h2d_bytes(device), missing);
            for d in 0..3 {
                let mut inbound = IntervalSet::new();
                let mut outbound = IntervalSet::new();
                for t in plan.h2d.iter().filter(|t| t.device == d) {
                    inbound.add(t.range.clone());
                }
                for t in plan.d2h.iter().filter(|t| t.device == d) {
                    outbound.add(t.range.clone());
                }
                for t in &plan.d2d {
                    if t.dst == d {
                        inbound.add(t.range.clone());
                    }
                    if t.src == d {
                        outbound.add(t.range.clone());
                    }
                }
                prop_assert!(!inbound.overlaps(&outbound), "device {} both sends and receives", d);
            }
            if !peer {
                prop_assert!(plan.d2d.is_empty());
            }
            engine.commit(&plan);

            let state = buf.state();
            prop_assert!(state.orphaned(SIZE).is_empty());
            let valid = state.device_valid(device);
            prop_assert!(read.is_empty() || valid.contains(read.clone()));
            prop_assert!(write.is_empty() || valid.contains(write.clone()));
            if !write.is_empty() {
                prop_assert_eq!(state.last_writer(), Some(Location::Device(device)));
                prop_assert!(!state.host_valid().intersects(write.clone()));
            }
        }
    }
}

#[test]
fn test_read_after_remote_write_stages_through_host() {
    let devices: Vec<Arc<dyn Device>> = (0..2)
        .map(|i| Arc::new(HostDevice::new(i)) as Arc<dyn Device>)
        .collect();
    let engine = CoherenceEngine::new(devices.clone(), false);
    let buf = Buffer::new(&devices, 64, BufferFlags::NONE, None).unwrap();

    let mut write = AccessSet::default();
    write.write(&buf, IntervalSet::from_range(0..32));
    let plan = engine
        .compute_transfers(vec![DeviceAccess { device: 0, access: write }])
        .unwrap();
    assert!(plan.is_empty());
    engine.commit(&plan);

    let mut read = AccessSet::default();
    read.require(&buf, IntervalSet::from_range(16..48));
    let plan = engine
        .compute_transfers(vec![DeviceAccess { device: 1, access: read }])
        .unwrap();
    assert_eq!(plan.d2h.len(), 1);
    assert_eq!(plan.d2h[0].device, 0);
    assert_eq!(plan.d2h[0].range, 16..32);
    assert_eq!(plan.h2d_bytes(1), 32);
    engine.commit(&plan);

    let state = buf.state();
    assert!(state.device_valid(1).contains(16..48));
    assert!(state.host_valid().contains(16..64));
}

#[test]
fn test_misaligned_combine_region_is_rejected() {
    let devices: Vec<Arc<dyn Device>> = vec![Arc::new(HostDevice::new(0))];
    let engine = CoherenceEngine::new(devices.clone(), false);
    let buf = Buffer::new(&devices, 64, BufferFlags::NONE, None).unwrap();

    let mut access = AccessSet::default();
    access.combine.push(vdev::coherence::CombineWrite {
        buffer: buf.clone(),
        op: CombineOp::Sum,
        elem: ElemType::U32,
        region: IntervalSet::from_range(2..10),
    });
    let err = engine
        .compute_transfers(vec![DeviceAccess { device: 0, access }])
        .unwrap_err();
    assert!(matches!(err, Error::Coherence(_)));
}
