use super::event::Event;
use crate::config::FailureStrategy;
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decides what a failed command does to the process.
///
/// A split kernel that failed on one device has no defined recovery, so the
/// default is to report and exit. `Record` keeps the process alive and
/// surfaces the failure through the command's event instead.
#[derive(Debug)]
pub struct FailureHandler {
    strategy: FailureStrategy,
    failure_count: AtomicUsize,
    last_error: Mutex<Option<Error>>,
}

impl FailureHandler {
    pub fn new(strategy: FailureStrategy) -> Self {
        Self {
            strategy,
            failure_count: AtomicUsize::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Completes `event` with `error` and applies the strategy.
    pub fn handle(&self, event: &Event, error: Error) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.clone());

        match self.strategy {
            FailureStrategy::Abort => {
                event.signal(Err(error.clone()));
                crate::error::fatal(&error);
            }
            FailureStrategy::Record => {
                tracing::warn!(
                    device = ?event.device(),
                    command = event.label(),
                    error = %error,
                    "command failed"
                );
                event.signal(Err(error));
            }
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().clone()
    }

    pub fn reset_count(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        *self.last_error.lock() = None;
    }

    pub fn strategy(&self) -> FailureStrategy {
        self.strategy
    }
}

impl Default for FailureHandler {
    fn default() -> Self {
        Self::new(FailureStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_strategy_fails_event() {
        let handler = FailureHandler::new(FailureStrategy::Record);
        let event = Event::new(Some(0), "exec");
        handler.handle(&event, Error::device(0, "launch", "out of resources"));

        assert!(matches!(event.wait(), Err(Error::Device { device: 0, .. })));
        assert_eq!(handler.failure_count(), 1);
        assert!(handler.last_error().is_some());

        handler.reset_count();
        assert_eq!(handler.failure_count(), 0);
    }

    #[test]
    fn test_default_is_abort() {
        assert_eq!(FailureHandler::default().strategy(), FailureStrategy::Abort);
    }
}
