//! Units of work executed by a device queue.

use super::event::Event;
use crate::coherence::Buffer;
use crate::device::{Device, LaunchArg};
use crate::error::{Error, Result};
use crate::kernel::{KernelBody, NdRange};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub type HostFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Scratch memory a partial read lands in.
pub type Scratch = Arc<Mutex<Vec<u8>>>;

pub enum CommandKind {
    /// Host shadow bytes into the queue device's replica.
    Write { buffer: Buffer, range: Range<u64> },
    /// Replica bytes back into the host shadow.
    Read { buffer: Buffer, range: Range<u64> },
    /// Replica bytes into a scratch vector, leaving the shadow untouched.
    ReadInto {
        buffer: Buffer,
        range: Range<u64>,
        out: Scratch,
    },
    /// Replica to replica over a direct peer path. `dst` is the position
    /// of the destination in the context's device list.
    Copy {
        buffer: Buffer,
        dst: usize,
        dst_device: Arc<dyn Device>,
        range: Range<u64>,
    },
    Exec {
        kernel: String,
        body: KernelBody,
        range: NdRange,
        args: Vec<LaunchArg>,
    },
    Fill {
        buffer: Buffer,
        range: Range<u64>,
        pattern: Vec<u8>,
    },
    HostFn(HostFn),
    /// No device effect; completes after everything before it.
    Marker,
}

impl CommandKind {
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::Write { .. } => "write",
            CommandKind::Read { .. } => "read",
            CommandKind::ReadInto { .. } => "read-into",
            CommandKind::Copy { .. } => "copy",
            CommandKind::Exec { .. } => "exec",
            CommandKind::Fill { .. } => "fill",
            CommandKind::HostFn(_) => "host-fn",
            CommandKind::Marker => "marker",
        }
    }

    /// Bytes moved from host to device and from device to host.
    pub fn traffic(&self) -> (u64, u64) {
        let len = |r: &Range<u64>| r.end - r.start;
        match self {
            CommandKind::Write { range, .. } => (len(range), 0),
            CommandKind::Read { range, .. } | CommandKind::ReadInto { range, .. } => {
                (0, len(range))
            }
            _ => (0, 0),
        }
    }

    /// Runs on `device`, which sits at `position` in the context's device
    /// list and therefore owns replica `position` of every buffer.
    pub(crate) fn run(self, device: &dyn Device, position: usize) -> Result<()> {
        match self {
            CommandKind::Write { buffer, range } => {
                buffer.check_range(&range)?;
                let shadow = buffer.shadow().read();
                device.write(
                    buffer.replica(position),
                    range.start,
                    &shadow[range.start as usize..range.end as usize],
                )
            }
            CommandKind::Read { buffer, range } => {
                buffer.check_range(&range)?;
                let mut shadow = buffer.shadow().write();
                device.read(
                    buffer.replica(position),
                    range.start,
                    &mut shadow[range.start as usize..range.end as usize],
                )
            }
            CommandKind::ReadInto { buffer, range, out } => {
                buffer.check_range(&range)?;
                let mut out = out.lock();
                out.resize((range.end - range.start) as usize, 0);
                device.read(buffer.replica(position), range.start, &mut out)
            }
            CommandKind::Copy {
                buffer,
                dst,
                dst_device,
                range,
            } => {
                buffer.check_range(&range)?;
                device.copy_to_peer(
                    dst_device.as_ref(),
                    buffer.replica(position),
                    buffer.replica(dst),
                    range,
                )
            }
            CommandKind::Exec {
                body, range, args, ..
            } => device.launch(&body, &range, &args),
            CommandKind::Fill {
                buffer,
                range,
                pattern,
            } => {
                buffer.check_range(&range)?;
                device.fill(buffer.replica(position), range, &pattern)
            }
            CommandKind::HostFn(f) => f(),
            CommandKind::Marker => Ok(()),
        }
    }
}

impl fmt::Debug for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Write { buffer, range } | CommandKind::Read { buffer, range } => {
                write!(f, "{}({:?}, {:?})", self.label(), buffer.id(), range)
            }
            CommandKind::ReadInto { buffer, range, .. } => {
                write!(f, "read-into({:?}, {:?})", buffer.id(), range)
            }
            CommandKind::Copy {
                buffer, dst, range, ..
            } => write!(f, "copy({:?} -> device {}, {:?})", buffer.id(), dst, range),
            CommandKind::Exec { kernel, range, .. } => {
                write!(f, "exec({}, {:?})", kernel, range.dim0())
            }
            CommandKind::Fill { buffer, range, .. } => {
                write!(f, "fill({:?}, {:?})", buffer.id(), range)
            }
            CommandKind::HostFn(_) => f.write_str("host-fn"),
            CommandKind::Marker => f.write_str("marker"),
        }
    }
}

/// A command together with its predecessors and its completion event.
#[derive(Debug)]
pub struct Command {
    pub(crate) kind: CommandKind,
    pub(crate) wait_list: Vec<Event>,
    pub(crate) event: Event,
}

impl Command {
    pub fn new(device: usize, kind: CommandKind, wait_list: Vec<Event>) -> Self {
        let event = Event::new(Some(device), kind.label());
        Self {
            kind,
            wait_list,
            event,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn wait_list(&self) -> &[Event] {
        &self.wait_list
    }

    /// Waits on every predecessor, then runs the command on `device` at
    /// `position`.
    ///
    /// Returns the outcome without signaling the event; the queue does that
    /// after its failure policy has seen the result.
    pub(crate) fn execute(
        self,
        device: &dyn Device,
        position: usize,
    ) -> (Event, (u64, u64), Result<()>) {
        let Command {
            kind,
            wait_list,
            event,
        } = self;
        let traffic = kind.traffic();
        let label = kind.label();

        for pred in &wait_list {
            if let Err(err) = pred.wait() {
                event.mark_running();
                let err = Error::queue(format!(
                    "{} on device {} skipped, predecessor failed: {}",
                    label,
                    position,
                    err
                ));
                return (event, traffic, Err(err));
            }
        }
        drop(wait_list);

        event.mark_running();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| kind.run(device, position)));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(Error::device(position, label, format!("panicked: {}", message)))
            }
        };
        (event, traffic, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coherence::BufferFlags;
    use crate::device::HostDevice;

    #[test]
    fn test_write_then_read_round_trip_through_replica() {
        let dev: Arc<dyn Device> = Arc::new(HostDevice::new(0));
        let buf = Buffer::new(
            &[dev.clone()],
            8,
            BufferFlags::COPY_HOST_PTR,
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
        )
        .unwrap();

        let write = Command::new(0, CommandKind::Write { buffer: buf.clone(), range: 0..8 }, vec![]);
        let (event, traffic, result) = write.execute(dev.as_ref(), 0);
        result.unwrap();
        event.signal(Ok(()));
        assert_eq!(traffic, (8, 0));

        buf.shadow().write().iter_mut().for_each(|b| *b = 0);
        let read = Command::new(0, CommandKind::Read { buffer: buf.clone(), range: 2..6 }, vec![]);
        let (_, traffic, result) = read.execute(dev.as_ref(), 0);
        result.unwrap();
        assert_eq!(traffic, (0, 4));
        assert_eq!(&buf.shadow().read()[..], &[0, 0, 3, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn test_failed_predecessor_skips_command() {
        let dev = HostDevice::new(0);
        let pred = Event::new(Some(1), "exec");
        pred.signal(Err(Error::device(1, "exec", "boom")));
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let cmd = Command::new(
            0,
            CommandKind::HostFn(Box::new(move || {
                *flag.lock() = true;
                Ok(())
            })),
            vec![pred],
        );
        let (_, _, result) = cmd.execute(&dev, 0);
        assert!(matches!(result, Err(Error::Queue(_))));
        assert!(!*ran.lock());
    }

    #[test]
    fn test_panicking_host_fn_becomes_device_error() {
        let dev = HostDevice::new(2);
        let cmd = Command::new(2, CommandKind::HostFn(Box::new(|| panic!("bad"))), vec![]);
        let (_, _, result) = cmd.execute(&dev, 2);
        match result {
            Err(Error::Device { device, message, .. }) => {
                assert_eq!(device, 2);
                assert!(message.contains("bad"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
