//! OS-thread identity
//!
//! `std::thread::current()` is unusable while thread-local destructors run,
//! which is exactly when thread teardown happens. This identity lives in a
//! const-initialized thread-local without a destructor, so it stays readable
//! for the whole life of the thread.

use core::fmt;
use core::num::NonZeroU64;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static IDENT: Cell<u64> = const { Cell::new(0) };
}

/// Identity of an OS thread, unique for the life of the process
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdent(NonZeroU64);

impl ThreadIdent {
    /// Identity of the calling thread
    #[inline]
    pub fn current() -> Self {
        IDENT.with(|cell| {
            let mut v = cell.get();
            if v == 0 {
                v = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
                cell.set(v);
            }
            match NonZeroU64::new(v) {
                Some(nz) => ThreadIdent(nz),
                None => unreachable!("thread identity counter wrapped"),
            }
        })
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// True when called on the thread this identity names
    #[inline]
    pub fn is_current(self) -> bool {
        self == ThreadIdent::current()
    }
}

impl fmt::Debug for ThreadIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadIdent({})", self.0)
    }
}

impl fmt::Display for ThreadIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_within_thread() {
        assert_eq!(ThreadIdent::current(), ThreadIdent::current());
        assert!(ThreadIdent::current().is_current());
    }

    #[test]
    fn test_distinct_across_threads() {
        let here = ThreadIdent::current();
        let there = std::thread::spawn(ThreadIdent::current).join().unwrap();
        assert_ne!(here, there);
        assert!(!there.is_current());
    }
}
