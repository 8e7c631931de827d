//! Ordered command sinks between submitters and a queue worker.
//!
//! Both implementations are bounded; a full sink makes the producer retry
//! rather than fail.

use super::command::Command;
use crate::util::Backoff;
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub trait CommandSink: Send + Sync {
    /// Appends a command, blocking while the sink is full.
    fn push(&self, command: Command);

    /// Takes the oldest command, waiting up to `timeout` for one to arrive.
    fn pop(&self, timeout: Duration) -> Option<Command>;

    fn try_pop(&self) -> Option<Command>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    /// Releases a consumer blocked in `pop`; later pops on an empty sink
    /// return at once.
    fn wake(&self);
}

/// Lock-free bounded ring. The consumer spins, yields, then sleeps briefly
/// while idle. Once woken, an empty ring no longer waits out the timeout.
pub struct RingFifo {
    ring: ArrayQueue<Command>,
    woken: AtomicBool,
}

impl std::fmt::Debug for RingFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingFifo")
            .field("len", &self.ring.len())
            .field("capacity", &self.ring.capacity())
            .finish()
    }
}

impl RingFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: ArrayQueue::new(capacity.max(1)),
            woken: AtomicBool::new(false),
        }
    }
}

impl CommandSink for RingFifo {
    fn push(&self, command: Command) {
        let backoff = Backoff::new();
        let mut command = command;
        while let Err(rejected) = self.ring.push(command) {
            command = rejected;
            backoff.snooze();
        }
    }

    fn pop(&self, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(command) = self.ring.pop() {
                return Some(command);
            }
            if self.woken.load(Ordering::Acquire) || Instant::now() >= deadline {
                return None;
            }
            if backoff.is_completed() {
                backoff.snooze();
            } else {
                backoff.spin();
            }
        }
    }

    fn try_pop(&self) -> Option<Command> {
        self.ring.pop()
    }

    fn len(&self) -> usize {
        self.ring.len()
    }

    fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::Release);
    }
}

/// Mutex and condition-variable list; the consumer sleeps while idle.
pub struct LockedFifo {
    list: Mutex<VecDeque<Command>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
    woken: AtomicBool,
}

impl std::fmt::Debug for LockedFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedFifo")
            .field("len", &self.list.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl LockedFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            woken: AtomicBool::new(false),
        }
    }
}

impl CommandSink for LockedFifo {
    fn push(&self, command: Command) {
        let mut list = self.list.lock();
        while list.len() >= self.capacity {
            self.not_full.wait(&mut list);
        }
        list.push_back(command);
        drop(list);
        self.not_empty.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        let mut list = self.list.lock();
        loop {
            if let Some(command) = list.pop_front() {
                drop(list);
                self.not_full.notify_one();
                return Some(command);
            }
            if self.woken.load(Ordering::Acquire) {
                return None;
            }
            if self.not_empty.wait_until(&mut list, deadline).timed_out() {
                let command = list.pop_front();
                if command.is_some() {
                    drop(list);
                    self.not_full.notify_one();
                }
                return command;
            }
        }
    }

    fn try_pop(&self) -> Option<Command> {
        let command = self.list.lock().pop_front();
        if command.is_some() {
            self.not_full.notify_one();
        }
        command
    }

    fn len(&self) -> usize {
        self.list.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn wake(&self) {
        let _list = self.list.lock();
        self.woken.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::command::CommandKind;
    use std::sync::Arc;
    use std::thread;

    fn marker() -> Command {
        Command::new(0, CommandKind::Marker, vec![])
    }

    fn check_fifo_order(sink: Arc<dyn CommandSink>) {
        let ids: Vec<_> = (0..8)
            .map(|_| {
                let c = marker();
                let id = c.event().id();
                sink.push(c);
                id
            })
            .collect();
        assert_eq!(sink.len(), 8);
        let popped: Vec<_> = (0..8)
            .map(|_| sink.pop(Duration::from_millis(10)).unwrap().event().id())
            .collect();
        assert_eq!(ids, popped);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_ring_fifo_order() {
        check_fifo_order(Arc::new(RingFifo::new(16)));
    }

    #[test]
    fn test_locked_fifo_order() {
        check_fifo_order(Arc::new(LockedFifo::new(16)));
    }

    #[test]
    fn test_pop_times_out_when_idle() {
        let locked = LockedFifo::new(4);
        let start = Instant::now();
        assert!(locked.pop(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        let ring = RingFifo::new(4);
        assert!(ring.pop(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_wake_releases_idle_consumer() {
        for sink in [
            Arc::new(LockedFifo::new(4)) as Arc<dyn CommandSink>,
            Arc::new(RingFifo::new(4)) as Arc<dyn CommandSink>,
        ] {
            let consumer = {
                let sink = sink.clone();
                thread::spawn(move || {
                    let start = Instant::now();
                    sink.pop(Duration::from_secs(10));
                    start.elapsed()
                })
            };
            thread::sleep(Duration::from_millis(20));
            sink.wake();
            assert!(consumer.join().unwrap() < Duration::from_secs(5));
        }
    }

    #[test]
    fn test_full_sink_blocks_producer_until_drained() {
        for sink in [
            Arc::new(LockedFifo::new(2)) as Arc<dyn CommandSink>,
            Arc::new(RingFifo::new(2)) as Arc<dyn CommandSink>,
        ] {
            sink.push(marker());
            sink.push(marker());
            let producer = {
                let sink = sink.clone();
                thread::spawn(move || sink.push(marker()))
            };
            thread::sleep(Duration::from_millis(20));
            assert_eq!(sink.len(), 2);
            assert!(sink.try_pop().is_some());
            producer.join().unwrap();
            assert_eq!(sink.len(), 2);
        }
    }
}
