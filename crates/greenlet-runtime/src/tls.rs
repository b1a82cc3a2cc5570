//! Thread-local storage for the greenlet runtime
//!
//! Each OS thread lazily gets one [`ThreadState`] on its first greenlet
//! operation. The slot's destructor tears the state down when the thread
//! exits.

use std::cell::RefCell;
use std::sync::Arc;

use greenlet_core::{GreenletError, GreenletId, GreenletResult};

use crate::thread_state::ThreadState;

struct ThreadSlot(RefCell<Option<Arc<ThreadState>>>);

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        let state = self.0.borrow_mut().take();
        if let Some(ts) = state {
            ts.teardown();
        }
    }
}

thread_local! {
    static SLOT: ThreadSlot = const { ThreadSlot(RefCell::new(None)) };
}

/// State of the calling thread, created on first use
///
/// Fails with `ThreadExited` once the thread is past its thread-local
/// teardown.
pub fn thread_state() -> GreenletResult<Arc<ThreadState>> {
    let found = SLOT.try_with(|slot| {
        if let Some(ts) = slot.0.borrow().as_ref() {
            return Arc::clone(ts);
        }
        let ts = ThreadState::new();
        *slot.0.borrow_mut() = Some(Arc::clone(&ts));
        ts
    });
    found.map_err(|_| GreenletError::ThreadExited.raise())
}

/// State of the calling thread, if it already has one
#[inline]
pub fn try_thread_state() -> Option<Arc<ThreadState>> {
    SLOT.try_with(|slot| slot.0.borrow().clone()).ok().flatten()
}

/// Id of the greenlet running on this thread, `GreenletId::NONE` if the
/// thread never used greenlets
#[inline]
pub fn current_greenlet_id() -> GreenletId {
    match try_thread_state() {
        Some(ts) => ts.current().id(),
        None => GreenletId::NONE,
    }
}

/// Check if a greenlet other than the main one is running here
#[inline]
pub fn is_in_greenlet() -> bool {
    try_thread_state().map_or(false, |ts| ts.in_fiber())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_per_thread() {
        let fresh = std::thread::spawn(|| {
            let before = try_thread_state().is_none();
            let none = current_greenlet_id() == GreenletId::NONE;
            let ts = thread_state().unwrap();
            let again = thread_state().unwrap();
            (before, none, Arc::ptr_eq(&ts, &again), ts.main().id())
        })
        .join()
        .unwrap();
        assert!(fresh.0);
        assert!(fresh.1);
        assert!(fresh.2);

        let ts = thread_state().unwrap();
        assert_ne!(ts.main().id(), fresh.3);
        assert_eq!(current_greenlet_id(), ts.main().id());
        assert!(!is_in_greenlet());
    }

    #[test]
    fn test_thread_exit_tears_down() {
        let (main, ts) = std::thread::spawn(|| {
            let ts = thread_state().unwrap();
            (ts.main(), Arc::downgrade(&ts))
        })
        .join()
        .unwrap();
        assert!(main.is_dead());
        assert!(ts.upgrade().is_none());
    }
}
