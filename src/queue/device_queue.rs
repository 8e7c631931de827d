//! Per-device command queues and their worker threads.

use super::command::{Command, CommandKind};
use super::event::Event;
use super::failure::FailureHandler;
use super::fifo::{CommandSink, LockedFifo, RingFifo};
use crate::config::{Config, FifoKind};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::telemetry::QueueMetrics;
use crate::util::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[cfg(target_os = "linux")]
fn pin_thread_to_core(core_id: usize) {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        let result = libc::sched_setaffinity(
            0, // current thread
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );
        if result != 0 {
            tracing::warn!(
                thread = std::thread::current().name().unwrap_or("unknown"),
                core = core_id,
                "failed to pin queue worker"
            );
        }
    }
}

struct Submission {
    last: Option<Event>,
    closed: bool,
}

/// In-order command queue of one device, drained by a dedicated worker.
pub struct DeviceQueue {
    position: usize,
    device: Arc<dyn Device>,
    sink: Arc<dyn CommandSink>,
    submission: Mutex<Submission>,
    shutdown: Arc<AtomicBool>,
    executed: Arc<CachePadded<AtomicU64>>,
    failures: Arc<FailureHandler>,
    metrics: Arc<QueueMetrics>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceQueue {
    /// Starts the worker for `device`, which sits at `position` in the
    /// context's device list.
    pub fn new(position: usize, device: Arc<dyn Device>, config: &Config) -> Result<Self> {
        let sink: Arc<dyn CommandSink> = match config.fifo {
            FifoKind::Ring => Arc::new(RingFifo::new(config.fifo_capacity)),
            FifoKind::Locked => Arc::new(LockedFifo::new(config.fifo_capacity)),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(CachePadded::new(AtomicU64::new(0)));
        let failures = Arc::new(FailureHandler::new(config.failure_strategy));
        let metrics = Arc::new(QueueMetrics::new(position));
        #[cfg(feature = "telemetry")]
        let record_metrics = config.enable_telemetry;
        #[cfg(not(feature = "telemetry"))]
        let record_metrics = false;

        let name = format!("{}-{}", config.thread_name_prefix, position);
        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let worker = Worker {
            position,
            device: device.clone(),
            sink: sink.clone(),
            shutdown: shutdown.clone(),
            executed: executed.clone(),
            failures: failures.clone(),
            metrics: metrics.clone(),
            record_metrics,
            idle_timeout: config.idle_timeout,
        };
        let pin_workers = config.pin_workers;
        let core = position % num_cpus::get().max(1);
        let handle = builder
            .spawn(move || {
                #[cfg(target_os = "linux")]
                if pin_workers {
                    pin_thread_to_core(core);
                }
                #[cfg(not(target_os = "linux"))]
                let _ = (pin_workers, core);

                worker.run();
            })
            .map_err(|e| Error::queue(format!("spawn failed: {}", e)))?;

        debug!(device = position, name = device.name(), "device queue started");

        Ok(Self {
            position,
            device,
            sink,
            submission: Mutex::new(Submission {
                last: None,
                closed: false,
            }),
            shutdown,
            executed,
            failures,
            metrics,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn index(&self) -> usize {
        self.position
    }

    /// Appends a command and returns its completion event without waiting.
    pub fn enqueue(&self, kind: CommandKind, wait_list: Vec<Event>) -> Result<Event> {
        let command = Command::new(self.position, kind, wait_list);
        let event = command.event().clone();

        let mut submission = self.submission.lock();
        if submission.closed {
            return Err(Error::queue(format!(
                "queue of device {} is shut down",
                self.position
            )));
        }
        trace!(device = self.position, command = ?command.kind(), "enqueue");
        self.sink.push(command);
        submission.last = Some(event.clone());
        Ok(event)
    }

    /// Enqueues and waits for the command to complete.
    pub fn enqueue_blocking(&self, kind: CommandKind, wait_list: Vec<Event>) -> Result<Event> {
        let event = self.enqueue(kind, wait_list)?;
        event.wait()?;
        Ok(event)
    }

    /// Event of the most recently enqueued command.
    pub fn last_event(&self) -> Option<Event> {
        self.submission.lock().last.clone()
    }

    /// Blocks until every command enqueued so far has completed.
    pub fn finish(&self) -> Result<()> {
        match self.last_event() {
            Some(event) => event.wait(),
            None => Ok(()),
        }
    }

    pub fn pending(&self) -> usize {
        self.sink.len()
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> &FailureHandler {
        &self.failures
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.submission.lock().closed
    }

    /// Stops accepting commands, runs whatever is still queued, and joins
    /// the worker.
    pub fn shutdown(&self) {
        {
            let mut submission = self.submission.lock();
            if submission.closed {
                return;
            }
            submission.closed = true;
            self.shutdown.store(true, Ordering::Release);
        }
        self.sink.wake();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(device = self.position, "queue worker panicked");
            }
        }
        debug!(
            device = self.position,
            executed = self.executed(),
            "device queue stopped"
        );
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeviceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceQueue")
            .field("device", &self.position)
            .field("pending", &self.pending())
            .field("executed", &self.executed())
            .finish()
    }
}

struct Worker {
    position: usize,
    device: Arc<dyn Device>,
    sink: Arc<dyn CommandSink>,
    shutdown: Arc<AtomicBool>,
    executed: Arc<CachePadded<AtomicU64>>,
    failures: Arc<FailureHandler>,
    metrics: Arc<QueueMetrics>,
    record_metrics: bool,
    idle_timeout: Duration,
}

impl Worker {
    fn run(&self) {
        loop {
            let idle_since = Instant::now();
            match self.sink.pop(self.idle_timeout) {
                Some(command) => {
                    self.record_idle(idle_since);
                    self.execute(command);
                }
                None => {
                    self.record_idle(idle_since);
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }

        // nothing can be pushed once the flag is set; run the leftovers
        let mut drained = 0usize;
        while let Some(command) = self.sink.try_pop() {
            self.execute(command);
            drained += 1;
        }
        if drained > 0 {
            debug!(device = self.position, drained, "drained queue on shutdown");
        }
    }

    fn record_idle(&self, since: Instant) {
        if self.record_metrics {
            self.metrics.record_idle_time(since.elapsed());
        }
    }

    fn execute(&self, command: Command) {
        let label = command.kind().label();
        let (event, (h2d, d2h), result) = command.execute(self.device.as_ref(), self.position);
        let duration = event
            .started_at()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        self.executed.fetch_add(1, Ordering::Relaxed);
        if self.record_metrics {
            self.metrics.record_command(label, duration, h2d, d2h);
        }

        match result {
            Ok(()) => event.signal(Ok(())),
            Err(err) => {
                if self.record_metrics {
                    self.metrics.record_failure();
                }
                self.failures.handle(&event, err);
            }
        }
    }
}
