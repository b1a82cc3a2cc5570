//! Minimal intrusive host object layer
//!
//! Every host object is an [`ObjectBox<T>`]: a reference-count header
//! followed by the value, allocated through the scoped allocator. The
//! header records the concrete type, its family (the prefix type it may be
//! viewed as) and two hooks used when the count reaches zero.

use core::any::TypeId;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::alloc::ScopedAllocator;
use crate::error::Failure;
use crate::gil::Gil;
use crate::refs::Borrowed;

/// Header shared by all host objects
#[repr(C)]
pub struct ObjectHeader {
    refcnt: AtomicUsize,
    type_id: TypeId,
    family: TypeId,
    type_name: &'static str,
    on_release: unsafe fn(NonNull<ObjectHeader>) -> bool,
    dealloc: unsafe fn(NonNull<ObjectHeader>),
}

impl ObjectHeader {
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Exact concrete type check
    #[inline]
    pub fn is<T: ObjectKind>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// True if the object may be viewed as a `T` (its family is `T`)
    #[inline]
    pub fn in_family<T: ObjectKind>(&self) -> bool {
        self.family == TypeId::of::<T>()
    }
}

/// Header plus value, the in-memory shape of every object
#[repr(C)]
pub struct ObjectBox<T> {
    header: ObjectHeader,
    value: T,
}

/// A type that can live inside a host object
pub trait ObjectKind: Send + Sync + Sized + 'static {
    /// Name reported in type-mismatch errors
    const NAME: &'static str;

    /// The prefix type this kind can be viewed as. Defaults to itself.
    fn family() -> TypeId {
        TypeId::of::<Self>()
    }

    /// Called when the last reference goes away, before storage is freed.
    ///
    /// Return `false` to keep the object; the hook must then have taken a
    /// new reference (`this.to_owned()`) and handed it to whoever finishes
    /// the release later.
    fn on_release(_this: Borrowed<'_, Self>) -> bool {
        true
    }
}

/// Marker for kinds laid out as a `#[repr(C)]` extension of `U`
///
/// # Safety
///
/// `Self` must be `#[repr(C)]` with a `U` as its first field and the same
/// alignment as `U`, and `Self::family()` must be `U`'s type id.
pub unsafe trait Extends<U: ObjectKind>: ObjectKind {}

macro_rules! object_kind {
    ($($ty:ty => $name:expr),* $(,)?) => {
        $(
            impl ObjectKind for $ty {
                const NAME: &'static str = $name;
            }
        )*
    };
}

object_kind! {
    () => "none",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    String => "str",
    &'static str => "str",
    Failure => "failure",
}

unsafe fn release_hook<T: ObjectKind>(hdr: NonNull<ObjectHeader>) -> bool {
    T::on_release(Borrowed::from_raw(hdr))
}

unsafe fn dealloc_hook<T: ObjectKind>(hdr: NonNull<ObjectHeader>) {
    let gil = Gil::ensure();
    ScopedAllocator::<ObjectBox<T>>::new().dispose(hdr.cast(), &gil);
}

/// Allocate a new object holding `value`, with one reference
pub(crate) fn alloc_object<T: ObjectKind>(value: T) -> NonNull<ObjectHeader> {
    let gil = Gil::ensure();
    let ptr = ScopedAllocator::<ObjectBox<T>>::new().allocate(1, &gil);
    unsafe {
        ptr.as_ptr().write(ObjectBox {
            header: ObjectHeader {
                refcnt: AtomicUsize::new(1),
                type_id: TypeId::of::<T>(),
                family: T::family(),
                type_name: T::NAME,
                on_release: release_hook::<T>,
                dealloc: dealloc_hook::<T>,
            },
            value,
        });
    }
    ptr.cast()
}

/// # Safety
///
/// `hdr` must point to a live object.
#[inline]
pub(crate) unsafe fn incref(hdr: NonNull<ObjectHeader>) {
    hdr.as_ref().refcnt.fetch_add(1, Ordering::Relaxed);
}

/// Drop one reference, running the release hook when it was the last
///
/// # Safety
///
/// `hdr` must point to a live object and the caller must own the reference.
pub(crate) unsafe fn decref(hdr: NonNull<ObjectHeader>) {
    if hdr.as_ref().refcnt.fetch_sub(1, Ordering::Release) != 1 {
        return;
    }
    fence(Ordering::Acquire);

    let (on_release, dealloc) = {
        let h = hdr.as_ref();
        (h.on_release, h.dealloc)
    };
    if on_release(hdr) {
        dealloc(hdr);
    }
}

/// # Safety
///
/// `hdr` must point to a live object whose family is `T` (or that is a `T`).
#[inline]
pub(crate) unsafe fn value_ref<'a, T>(hdr: NonNull<ObjectHeader>) -> &'a T {
    &(*hdr.cast::<ObjectBox<T>>().as_ptr()).value
}
