//! Backoff for producers and consumers polling the lock-free command ring.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Spins with doubling length, then yields, then sleeps.
#[derive(Debug, Default)]
pub struct Backoff {
    step: AtomicUsize,
}

impl Backoff {
    const SPIN_LIMIT: usize = 6;
    const YIELD_LIMIT: usize = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.step.store(0, Ordering::Relaxed);
    }

    /// One step of backoff while the other side is expected to make
    /// progress soon.
    pub fn spin(&self) {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        if step <= Self::SPIN_LIMIT {
            for _ in 0..(1 << step) {
                spin_loop();
            }
        } else if step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(1));
        }
    }

    /// Spinning no longer pays off.
    pub fn is_completed(&self) -> bool {
        self.step.load(Ordering::Relaxed) > Self::YIELD_LIMIT
    }

    /// Waits for a slot or a command that may take a while.
    pub fn snooze(&self) {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        if step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progression_and_reset() {
        let backoff = Backoff::new();
        assert!(!backoff.is_completed());
        for _ in 0..=Backoff::YIELD_LIMIT {
            backoff.spin();
        }
        assert!(backoff.is_completed());
        backoff.reset();
        assert!(!backoff.is_completed());
    }

    #[test]
    fn test_snooze_advances() {
        let backoff = Backoff::new();
        for _ in 0..=Backoff::YIELD_LIMIT {
            backoff.snooze();
        }
        assert!(backoff.is_completed());
    }
}
