//! Per-thread pending-failure slot
//!
//! Errors leaving the core are registered here (first one wins) in
//! addition to being returned. The slot holds a `Failure` host object.
//! A switch that resumes its caller normally clears the slot, so a failure
//! that was caught and handled does not shadow the next one.

use core::cell::RefCell;
use core::ptr::NonNull;

use crate::error::{Failure, GreenletError};
use crate::object::ObjectHeader;
use crate::refs::{AnyObject, Object, OutParam, Owned};

thread_local! {
    static PENDING: RefCell<Option<Object>> = const { RefCell::new(None) };
}

/// True if a failure is pending on this thread
pub fn occurred() -> bool {
    PENDING.try_with(|slot| slot.borrow().is_some()).unwrap_or(false)
}

/// Register `err` unless something is already pending
pub fn set_if_empty(err: &GreenletError) {
    if occurred() {
        return;
    }
    set_failure_if_empty(Failure::from(err));
}

/// Register `failure` unless something is already pending
pub fn set_failure_if_empty(failure: Failure) {
    let obj = Owned::new(failure).into_any();
    let rejected = PENDING
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(obj);
                None
            } else {
                Some(obj)
            }
        })
        .ok()
        .flatten();
    drop(rejected);
}

/// Move the pending failure object into `out`. Returns false if none.
pub fn fetch(out: &mut OutParam<AnyObject>) -> bool {
    unsafe { fetch_into(out.as_mut_ptr()) }
}

/// Raw form of [`fetch`]
///
/// # Safety
///
/// `slot` must be valid for writes. Whatever reference it holds is released.
pub unsafe fn fetch_into(slot: *mut Option<NonNull<ObjectHeader>>) -> bool {
    let taken = PENDING.try_with(|p| p.borrow_mut().take()).ok().flatten();
    match taken {
        Some(obj) => {
            let old = core::mem::replace(&mut *slot, obj.into_raw());
            drop(Owned::<AnyObject>::from_raw(old));
            true
        }
        None => false,
    }
}

/// Take the pending failure as a value
pub fn take_failure() -> Option<Failure> {
    let mut out = OutParam::new();
    if !fetch(&mut out) {
        return None;
    }
    let obj = out.take()?;
    let failure = obj.borrow().try_cast::<Failure>().map(|f| (*f).clone());
    failure
}

/// Discard anything pending
pub fn clear() {
    let old = PENDING.try_with(|p| p.borrow_mut().take()).ok().flatten();
    drop(old);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_wins() {
        clear();
        set_failure_if_empty(Failure::new("first"));
        set_failure_if_empty(Failure::new("second"));
        assert_eq!(take_failure().unwrap().message(), "first");
        assert!(take_failure().is_none());
    }

    #[test]
    fn test_fetch_through_outparam() {
        clear();
        let _ = GreenletError::SwitchDuringRelease.raise();

        let mut out = OutParam::new();
        assert!(fetch(&mut out));
        assert!(!occurred());
        let obj = out.take().unwrap();
        assert!(obj.is::<Failure>());
        assert_eq!(obj.refcount(), 1);

        let mut empty = OutParam::new();
        assert!(!fetch(&mut empty));
        assert!(!empty.is_some());
    }

    #[test]
    fn test_slot_is_per_thread() {
        clear();
        set_failure_if_empty(Failure::new("here"));
        let seen_there = std::thread::spawn(occurred).join().unwrap();
        assert!(!seen_there);
        assert!(occurred());
        clear();
    }
}
