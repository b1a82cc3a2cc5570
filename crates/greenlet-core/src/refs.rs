//! Reference-ownership wrappers
//!
//! Three disciplines over the same raw object pointer:
//!
//! - [`Borrowed`]: not owned. Valid only while somebody else keeps the
//!   object alive. Cannot release.
//! - [`Owned`]: exactly one counted reference, released on drop.
//! - [`OutParam`]: an empty slot a lower-level call fills with one new
//!   reference. Taken at most once; released on drop if never taken.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

use crate::error::{GreenletError, GreenletResult};
use crate::object::{self, Extends, ObjectHeader, ObjectKind};

/// The untyped object view
///
/// Uninhabited: a `Borrowed<AnyObject>` or `Owned<AnyObject>` can be
/// inspected and downcast but never dereferenced.
pub enum AnyObject {}

/// An untyped owned reference
pub type Object = Owned<AnyObject>;

type RawObject = Option<NonNull<ObjectHeader>>;

/// A non-owning reference
pub struct Borrowed<'a, T = AnyObject> {
    ptr: RawObject,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> Clone for Borrowed<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Borrowed<'a, T> {}

impl<'a, T> Borrowed<'a, T> {
    /// The null reference
    pub const fn null() -> Self {
        Borrowed { ptr: None, _marker: PhantomData }
    }

    /// # Safety
    ///
    /// `ptr` must name a live object of kind `T` (or family `T`) that stays
    /// alive for `'a`.
    pub unsafe fn from_raw(ptr: NonNull<ObjectHeader>) -> Self {
        Borrowed { ptr: Some(ptr), _marker: PhantomData }
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        self.ptr.is_some()
    }

    #[inline]
    pub fn as_ptr(&self) -> Option<NonNull<ObjectHeader>> {
        self.ptr
    }

    pub fn header(&self) -> Option<&'a ObjectHeader> {
        // Safety: a non-null borrowed pointer is live for 'a
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Name of the object's concrete kind, `"null"` for the null reference
    pub fn type_name(&self) -> &'static str {
        self.header().map_or("null", ObjectHeader::type_name)
    }

    /// Take a new counted reference to the same object
    pub fn to_owned(&self) -> Owned<T> {
        if let Some(p) = self.ptr {
            unsafe { object::incref(p) };
        }
        Owned { ptr: self.ptr, _marker: PhantomData }
    }

    pub fn into_any(self) -> Borrowed<'a, AnyObject> {
        Borrowed { ptr: self.ptr, _marker: PhantomData }
    }

    pub fn upcast<U: ObjectKind>(self) -> Borrowed<'a, U>
    where
        T: Extends<U>,
    {
        Borrowed { ptr: self.ptr, _marker: PhantomData }
    }

    pub fn ptr_eq<U>(&self, other: &Borrowed<'_, U>) -> bool {
        self.ptr == other.ptr
    }
}

impl<'a> Borrowed<'a, AnyObject> {
    fn mismatch(&self, expected: &'static str) -> GreenletError {
        GreenletError::TypeMismatch { expected, found: self.type_name() }.raise()
    }

    /// Typed view of an object of exactly kind `T`
    ///
    /// On mismatch the `TypeMismatch` error is also registered as the
    /// thread's pending failure if none is pending yet.
    pub fn downcast<T: ObjectKind>(self) -> GreenletResult<Borrowed<'a, T>> {
        match self.try_cast::<T>() {
            Some(b) => Ok(b),
            None => Err(self.mismatch(T::NAME)),
        }
    }

    /// Typed view of any object in family `T` (a `T` or an extension of it)
    pub fn downcast_family<T: ObjectKind>(self) -> GreenletResult<Borrowed<'a, T>> {
        match self.header() {
            Some(h) if h.in_family::<T>() => Ok(Borrowed { ptr: self.ptr, _marker: PhantomData }),
            _ => Err(self.mismatch(T::NAME)),
        }
    }

    /// Like [`downcast`](Self::downcast) but silent on mismatch
    pub fn try_cast<T: ObjectKind>(self) -> Option<Borrowed<'a, T>> {
        match self.header() {
            Some(h) if h.is::<T>() => Some(Borrowed { ptr: self.ptr, _marker: PhantomData }),
            _ => None,
        }
    }

    #[inline]
    pub fn is<T: ObjectKind>(&self) -> bool {
        self.header().is_some_and(ObjectHeader::is::<T>)
    }
}

impl<'a, T: ObjectKind> Borrowed<'a, T> {
    /// The referenced value, or `None` for the null reference
    pub fn get(&self) -> Option<&'a T> {
        self.ptr.map(|p| unsafe { object::value_ref::<T>(p) })
    }
}

impl<'a, T: ObjectKind> Deref for Borrowed<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Some(v) => v,
            None => panic!("dereferenced a null {} reference", T::NAME),
        }
    }
}

impl<'a, T> fmt::Debug for Borrowed<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(p) => write!(f, "Borrowed<{}>({:p})", self.type_name(), p),
            None => write!(f, "Borrowed(null)"),
        }
    }
}

impl<'a, T> From<&'a Owned<T>> for Borrowed<'a, T> {
    fn from(owned: &'a Owned<T>) -> Self {
        owned.borrow()
    }
}

/// One counted reference, released on drop
pub struct Owned<T = AnyObject> {
    ptr: RawObject,
    _marker: PhantomData<T>,
}

// Safety: every ObjectKind is Send + Sync and the count is atomic
unsafe impl<T: Send + Sync> Send for Owned<T> {}
unsafe impl<T: Send + Sync> Sync for Owned<T> {}

impl<T: ObjectKind> Owned<T> {
    /// Allocate a fresh object holding `value`
    pub fn new(value: T) -> Self {
        Owned { ptr: Some(object::alloc_object(value)), _marker: PhantomData }
    }
}

impl<T> Owned<T> {
    pub const fn null() -> Self {
        Owned { ptr: None, _marker: PhantomData }
    }

    /// Adopt a reference the caller already owns
    ///
    /// # Safety
    ///
    /// `ptr` must carry one owned reference to an object of kind `T`.
    pub(crate) unsafe fn from_raw(ptr: RawObject) -> Self {
        Owned { ptr, _marker: PhantomData }
    }

    /// Give up ownership without releasing
    pub(crate) fn into_raw(self) -> RawObject {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        self.ptr.is_some()
    }

    #[inline]
    pub fn borrow(&self) -> Borrowed<'_, T> {
        Borrowed { ptr: self.ptr, _marker: PhantomData }
    }

    /// Identity of the referenced object, for comparisons and logging
    #[inline]
    pub fn as_ptr(&self) -> *const ObjectHeader {
        self.ptr.map_or(core::ptr::null(), |p| p.as_ptr() as *const _)
    }

    pub fn refcount(&self) -> usize {
        self.borrow().header().map_or(0, ObjectHeader::refcount)
    }

    pub fn type_name(&self) -> &'static str {
        self.borrow().type_name()
    }

    pub fn into_any(self) -> Owned<AnyObject> {
        Owned { ptr: self.into_raw(), _marker: PhantomData }
    }

    pub fn upcast<U: ObjectKind>(self) -> Owned<U>
    where
        T: Extends<U>,
    {
        Owned { ptr: self.into_raw(), _marker: PhantomData }
    }

    pub fn ptr_eq<U>(&self, other: &Owned<U>) -> bool {
        self.ptr == other.ptr
    }
}

impl Owned<AnyObject> {
    /// Typed reference to an object of exactly kind `T`; the reference is
    /// released on mismatch.
    pub fn downcast<T: ObjectKind>(self) -> GreenletResult<Owned<T>> {
        self.borrow().downcast::<T>()?;
        Ok(Owned { ptr: self.into_raw(), _marker: PhantomData })
    }

    pub fn downcast_family<T: ObjectKind>(self) -> GreenletResult<Owned<T>> {
        self.borrow().downcast_family::<T>()?;
        Ok(Owned { ptr: self.into_raw(), _marker: PhantomData })
    }

    #[inline]
    pub fn is<T: ObjectKind>(&self) -> bool {
        self.borrow().is::<T>()
    }
}

impl<T: ObjectKind> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.ptr {
            Some(p) => unsafe { object::value_ref::<T>(p) },
            None => panic!("dereferenced a null {} reference", T::NAME),
        }
    }
}

impl<T> Clone for Owned<T> {
    fn clone(&self) -> Self {
        self.borrow().to_owned()
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            unsafe { object::decref(p) };
        }
    }
}

impl<T> Default for Owned<T> {
    fn default() -> Self {
        Owned::null()
    }
}

impl<T> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(p) => write!(f, "Owned<{}>({:p})", self.type_name(), p),
            None => write!(f, "Owned(null)"),
        }
    }
}

/// Slot for a new reference produced by a lower-level call
pub struct OutParam<T = AnyObject> {
    slot: RawObject,
    _marker: PhantomData<T>,
}

impl<T> OutParam<T> {
    pub const fn new() -> Self {
        OutParam { slot: None, _marker: PhantomData }
    }

    /// Raw slot for a callee that writes one owned reference into it
    pub fn as_mut_ptr(&mut self) -> *mut Option<NonNull<ObjectHeader>> {
        &mut self.slot
    }

    /// Store a reference, releasing whatever the slot held before
    pub fn put(&mut self, value: Owned<T>) {
        let old = mem::replace(&mut self.slot, value.into_raw());
        drop(unsafe { Owned::<T>::from_raw(old) });
    }

    /// Take the stored reference out; later calls return `None`
    pub fn take(&mut self) -> Option<Owned<T>> {
        self.slot.take().map(|p| unsafe { Owned::from_raw(Some(p)) })
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        self.slot.is_some()
    }
}

impl<T> Default for OutParam<T> {
    fn default() -> Self {
        OutParam::new()
    }
}

impl<T> Drop for OutParam<T> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending;

    #[test]
    fn test_owned_clone_and_drop_balance() {
        let a = Owned::new(String::from("hi"));
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        assert!(a.ptr_eq(&b));
        drop(b);
        assert_eq!(a.refcount(), 1);
        assert_eq!(a.as_str(), "hi");
    }

    #[test]
    fn test_borrowed_to_owned_takes_new_reference() {
        let a = Owned::new(3u32);
        let b = a.borrow();
        assert!(b.is_some());
        assert_eq!(*b, 3);
        let c = b.to_owned();
        assert_eq!(a.refcount(), 2);
        drop(c);
        assert_eq!(a.refcount(), 1);
    }

    #[test]
    fn test_downcast_mismatch_sets_pending() {
        pending::clear();
        let obj = Owned::new(1.5f64).into_any();
        let err = obj.borrow().downcast::<i64>().unwrap_err();
        assert_eq!(err, GreenletError::TypeMismatch { expected: "i64", found: "f64" });
        assert!(pending::occurred());
        pending::clear();

        let typed = obj.downcast::<f64>().unwrap();
        assert_eq!(*typed, 1.5);
        assert!(!pending::occurred());
    }

    #[test]
    fn test_owned_downcast_failure_releases() {
        pending::clear();
        let keep = Owned::new(9i32);
        let any = keep.clone().into_any();
        assert_eq!(keep.refcount(), 2);
        assert!(any.downcast::<bool>().is_err());
        assert_eq!(keep.refcount(), 1);
        pending::clear();
    }

    #[test]
    fn test_null_references() {
        let n: Owned<i64> = Owned::null();
        assert!(!n.is_some());
        assert_eq!(n.refcount(), 0);
        assert_eq!(n.borrow().type_name(), "null");
        assert!(n.borrow().get().is_none());
        let b: Borrowed<'_> = Borrowed::null();
        assert!(!b.is_some());
    }

    #[test]
    fn test_outparam_take_once_and_release_leftover() {
        let value = Owned::new(5i64);

        let mut out = OutParam::<i64>::new();
        out.put(value.clone());
        assert!(out.is_some());
        assert_eq!(value.refcount(), 2);
        let got = out.take().unwrap();
        assert!(out.take().is_none());
        drop(got);
        assert_eq!(value.refcount(), 1);

        {
            let mut leftover = OutParam::<i64>::new();
            leftover.put(value.clone());
            assert_eq!(value.refcount(), 2);
        }
        assert_eq!(value.refcount(), 1);
    }

    #[test]
    fn test_outparam_raw_slot() {
        let value = Owned::new(true);
        let mut out = OutParam::<bool>::new();
        unsafe { *out.as_mut_ptr() = value.clone().into_raw() };
        assert_eq!(*out.take().unwrap(), true);
        assert_eq!(value.refcount(), 1);
    }
}
