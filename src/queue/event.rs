//! Completion events shared between a command and its waiters.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static EVENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    fn next() -> Self {
        EventId(EVENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    Failed(String),
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Failed(_))
    }
}

struct EventState {
    status: EventStatus,
    error: Option<Error>,
    started: Option<Instant>,
    ended: Option<Instant>,
}

struct EventInner {
    id: EventId,
    device: Option<usize>,
    label: &'static str,
    queued: Instant,
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Signaled by exactly one command, observed by any number of waiters.
///
/// Cloning retains the event; dropping a clone releases it. The last holder
/// frees it.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(device: Option<usize>, label: &'static str) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: EventId::next(),
                device,
                label,
                queued: Instant::now(),
                state: Mutex::new(EventState {
                    status: EventStatus::Queued,
                    error: None,
                    started: None,
                    ended: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// An event that is already complete.
    pub fn completed() -> Self {
        let event = Self::new(None, "immediate");
        event.mark_running();
        event.signal(Ok(()));
        event
    }

    pub fn id(&self) -> EventId {
        self.inner.id
    }

    pub fn device(&self) -> Option<usize> {
        self.inner.device
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    pub fn retain(&self) -> Event {
        self.clone()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().status.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().status.is_terminal()
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.inner.state.lock();
        if state.status == EventStatus::Queued {
            state.status = EventStatus::Running;
            state.started = Some(Instant::now());
        }
    }

    /// Completes the event. Only the owning command calls this, once.
    pub(crate) fn signal(&self, result: Result<()>) {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            debug_assert!(false, "event {:?} signaled twice", self.inner.id);
            return;
        }
        let now = Instant::now();
        state.started.get_or_insert(now);
        state.ended = Some(now);
        match result {
            Ok(()) => state.status = EventStatus::Complete,
            Err(err) => {
                state.status = EventStatus::Failed(err.to_string());
                state.error = Some(err);
            }
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.status.is_terminal() {
            self.inner.cond.wait(&mut state);
        }
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`; `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.status.is_terminal() {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.status.is_terminal());
            }
        }
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(true),
        }
    }

    /// Device-side execution time, available once complete.
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.inner.state.lock();
        match (state.started, state.ended) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Time between enqueue and start of execution.
    pub fn queue_delay(&self) -> Option<Duration> {
        let state = self.inner.state.lock();
        state.started.map(|s| s.duration_since(self.inner.queued))
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.inner.state.lock().started
    }

    pub fn ended_at(&self) -> Option<Instant> {
        self.inner.state.lock().ended
    }

    pub fn same(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}

/// Waits on every event, returning the first failure after all have finished.
pub fn wait_all<'a, I>(events: I) -> Result<()>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut first_err = None;
    for event in events {
        if let Err(err) = event.wait() {
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Sum of device-side execution times of the completed events.
pub fn total_elapsed<'a, I>(events: I) -> Duration
where
    I: IntoIterator<Item = &'a Event>,
{
    events.into_iter().filter_map(|e| e.elapsed()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_wakes_waiters() {
        let event = Event::new(Some(0), "test");
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let e = event.retain();
                thread::spawn(move || e.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        event.mark_running();
        event.signal(Ok(()));

        for w in waiters {
            assert!(w.join().unwrap().is_ok());
        }
        assert!(event.is_complete());
        assert!(event.elapsed().is_some());
    }

    #[test]
    fn test_failed_event_reports_error() {
        let event = Event::new(Some(1), "write");
        event.signal(Err(Error::device(1, "write", "rejected")));
        assert!(matches!(event.wait(), Err(Error::Device { device: 1, .. })));
        assert!(matches!(event.status(), EventStatus::Failed(_)));
    }

    #[test]
    fn test_wait_timeout() {
        let event = Event::new(None, "pending");
        assert_eq!(event.wait_timeout(Duration::from_millis(5)).unwrap(), false);
        event.signal(Ok(()));
        assert!(event.wait_timeout(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_refcount() {
        let event = Event::completed();
        assert_eq!(event.ref_count(), 1);
        let other = event.retain();
        assert_eq!(event.ref_count(), 2);
        assert!(other.same(&event));
        drop(other);
        assert_eq!(event.ref_count(), 1);
    }
}
