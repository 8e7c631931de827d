//! Keeps counters written by different threads on separate cache lines.

use std::fmt;
use std::ops::Deref;

#[repr(align(64))]
#[derive(Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_counter_fills_a_line() {
        assert_eq!(align_of::<CachePadded<AtomicU64>>(), 64);
        assert_eq!(size_of::<CachePadded<AtomicU64>>(), 64);
        let counter = CachePadded::new(AtomicU64::new(1));
        counter.fetch_add(2, Ordering::Relaxed);
        assert_eq!(counter.into_inner().into_inner(), 3);
    }
}
