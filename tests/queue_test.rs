use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vdev::device::{Device, HostDevice};
use vdev::prelude::*;
use vdev::queue::{CommandKind, DeviceQueue};

fn config(fifo: FifoKind) -> Config {
    Config::builder()
        .fifo(fifo)
        .fifo_capacity(16)
        .failure_strategy(FailureStrategy::Record)
        .build()
        .unwrap()
}

fn queue(position: usize, fifo: FifoKind) -> DeviceQueue {
    let device: Arc<dyn Device> = Arc::new(HostDevice::new(position));
    DeviceQueue::new(position, device, &config(fifo)).unwrap()
}

fn push(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> CommandKind {
    let log = log.clone();
    CommandKind::HostFn(Box::new(move || {
        log.lock().push(tag);
        Ok(())
    }))
}

#[test]
fn test_wait_list_orders_commands_across_queues() {
    for fifo in [FifoKind::Locked, FifoKind::Ring] {
        let q0 = queue(0, fifo);
        let q1 = queue(1, fifo);
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = log.clone();
        let first = q0
            .enqueue(
                CommandKind::HostFn(Box::new(move || {
                    thread::sleep(Duration::from_millis(30));
                    slow_log.lock().push("producer");
                    Ok(())
                })),
                vec![],
            )
            .unwrap();
        let second = q1.enqueue(push(&log, "consumer"), vec![first.clone()]).unwrap();

        second.wait().unwrap();
        assert_eq!(*log.lock(), vec!["producer", "consumer"]);
        assert!(first.is_complete());
        assert!(second.ended_at().unwrap() >= first.ended_at().unwrap());
    }
}

#[test]
fn test_concurrent_producers_keep_their_own_order() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    for fifo in [FifoKind::Locked, FifoKind::Ring] {
        let q = Arc::new(queue(0, fifo));
        let log = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                let log = log.clone();
                thread::spawn(move || {
                    (0..PER_PRODUCER)
                        .map(|seq| {
                            let log = log.clone();
                            q.enqueue(
                                CommandKind::HostFn(Box::new(move || {
                                    log.lock().push((p, seq));
                                    Ok(())
                                })),
                                vec![],
                            )
                            .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let events: Vec<Event> = producers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        wait_all(&events).unwrap();
        let log = log.lock();
        assert_eq!(log.len(), PRODUCERS * PER_PRODUCER);
        for p in 0..PRODUCERS {
            let seen: Vec<usize> = log.iter().filter(|(who, _)| *who == p).map(|(_, s)| *s).collect();
            assert_eq!(seen, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
        assert_eq!(q.executed(), (PRODUCERS * PER_PRODUCER) as u64);
    }
}

#[test]
fn test_shutdown_runs_every_queued_command() {
    let q = queue(0, FifoKind::Ring);
    let counter = Arc::new(Mutex::new(0u32));

    let mut events = vec![q
        .enqueue(
            CommandKind::HostFn(Box::new(|| {
                thread::sleep(Duration::from_millis(20));
                Ok(())
            })),
            vec![],
        )
        .unwrap()];
    for _ in 0..12 {
        let counter = counter.clone();
        events.push(
            q.enqueue(
                CommandKind::HostFn(Box::new(move || {
                    *counter.lock() += 1;
                    Ok(())
                })),
                vec![],
            )
            .unwrap(),
        );
    }
    q.shutdown();

    assert_eq!(*counter.lock(), 12);
    assert!(events.iter().all(Event::is_complete));
    assert_eq!(q.executed(), 13);
    assert!(q.enqueue(CommandKind::Marker, vec![]).is_err());
}

#[test]
fn test_recorded_failure_propagates_to_dependents_only() {
    let q0 = queue(0, FifoKind::Locked);
    let q1 = queue(1, FifoKind::Locked);

    let failed = q0
        .enqueue(
            CommandKind::HostFn(Box::new(|| Err(Error::device(0, "exec", "out of resources")))),
            vec![],
        )
        .unwrap();
    let dependent = q1.enqueue(CommandKind::Marker, vec![failed.clone()]).unwrap();
    let independent = q1.enqueue(CommandKind::Marker, vec![]).unwrap();

    assert!(matches!(failed.wait(), Err(Error::Device { device: 0, .. })));
    assert!(dependent.wait().is_err());
    assert!(matches!(dependent.status(), EventStatus::Failed(_)));
    independent.wait().unwrap();

    assert!(wait_all([&failed, &independent]).is_err());
    assert_eq!(q0.failures().failure_count(), 1);
    assert_eq!(q1.failures().failure_count(), 1);
}

#[test]
fn test_events_record_device_timing() {
    let q = queue(0, FifoKind::Locked);
    let event = q
        .enqueue(
            CommandKind::HostFn(Box::new(|| {
                thread::sleep(Duration::from_millis(5));
                Ok(())
            })),
            vec![],
        )
        .unwrap();
    event.wait().unwrap();
    assert_eq!(event.device(), Some(0));
    assert_eq!(event.label(), "host-fn");
    assert!(event.elapsed().unwrap() >= Duration::from_millis(5));
    assert!(event.queue_delay().is_some());
}
