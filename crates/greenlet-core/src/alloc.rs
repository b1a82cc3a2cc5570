//! Scoped allocation for host objects and runtime bookkeeping
//!
//! Single objects come from a small-object pool with 16-byte size classes;
//! arrays come from the general-purpose allocator. Both routes require the
//! global lock, witnessed by a `&GilGuard`.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::gil::{Gil, GilGuard};

/// Size-class granule of the small-object pool
pub const POOL_GRANULE: usize = 16;

/// Largest request served by the small-object pool
pub const POOL_MAX_SIZE: usize = 512;

const POOL_CLASSES: usize = POOL_MAX_SIZE / POOL_GRANULE;

/// Free blocks kept per size class before returning memory to the system
const POOL_FREE_CAP: usize = 256;

/// Alignment `malloc` guarantees on the platforms we build for
const MALLOC_ALIGN: usize = 2 * mem::size_of::<usize>();

/// Counters exposed by the small-object pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Single-object allocations served by a size class
    pub small_allocs: u64,
    /// Of those, how many reused a freed block
    pub reused: u64,
    /// Array allocations routed to the general allocator
    pub bulk_allocs: u64,
    /// Blocks handed back, from either route
    pub releases: u64,
}

/// LIFO free lists, one per 16-byte size class
pub struct SmallObjectPool {
    free: [Vec<NonNull<u8>>; POOL_CLASSES],
    stats: PoolStats,
}

impl SmallObjectPool {
    pub const fn new() -> Self {
        const EMPTY: Vec<NonNull<u8>> = Vec::new();
        SmallObjectPool {
            free: [EMPTY; POOL_CLASSES],
            stats: PoolStats { small_allocs: 0, reused: 0, bulk_allocs: 0, releases: 0 },
        }
    }

    /// Size class index for `layout`, or `None` if the pool does not serve it
    fn class_of(layout: Layout) -> Option<usize> {
        let size = layout.size();
        if size == 0 || size > POOL_MAX_SIZE || layout.align() > POOL_GRANULE {
            return None;
        }
        Some((size + POOL_GRANULE - 1) / POOL_GRANULE - 1)
    }

    fn class_layout(class: usize) -> Layout {
        // Size is a multiple of the granule and the granule is a power of two.
        unsafe { Layout::from_size_align_unchecked((class + 1) * POOL_GRANULE, POOL_GRANULE) }
    }

    /// Allocate one block fitting `layout`
    pub fn alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return NonNull::new(layout.align() as *mut u8);
        }
        match Self::class_of(layout) {
            Some(class) => {
                self.stats.small_allocs += 1;
                if let Some(block) = self.free[class].pop() {
                    self.stats.reused += 1;
                    return Some(block);
                }
                NonNull::new(unsafe { std::alloc::alloc(Self::class_layout(class)) })
            }
            None => NonNull::new(unsafe { std::alloc::alloc(layout) }),
        }
    }

    /// Return a block obtained from [`alloc`](Self::alloc) with the same layout
    ///
    /// # Safety
    ///
    /// `block` must come from this pool's `alloc` with an identical `layout`
    /// and must not be used afterwards.
    pub unsafe fn free(&mut self, block: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        self.stats.releases += 1;
        match Self::class_of(layout) {
            Some(class) if self.free[class].len() < POOL_FREE_CAP => self.free[class].push(block),
            Some(class) => std::alloc::dealloc(block.as_ptr(), Self::class_layout(class)),
            None => std::alloc::dealloc(block.as_ptr(), layout),
        }
    }

    fn note_bulk_alloc(&mut self) {
        self.stats.bulk_allocs += 1;
    }

    fn note_bulk_release(&mut self) {
        self.stats.releases += 1;
    }

    /// Number of cached free blocks across all classes
    pub fn cached_blocks(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

impl Default for SmallObjectPool {
    fn default() -> Self {
        SmallObjectPool::new()
    }
}

/// Snapshot of the process-wide pool counters
pub fn pool_stats(gil: &GilGuard) -> PoolStats {
    gil.pool().stats()
}

/// Typed allocator that may only be used with the global lock held
///
/// `n == 1` requests go to the small-object pool, anything larger to the
/// general allocator. Deallocation must pass the same `n`.
pub struct ScopedAllocator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ScopedAllocator<T> {
    pub const fn new() -> Self {
        ScopedAllocator { _marker: PhantomData }
    }

    fn layout(n: usize) -> Layout {
        match Layout::array::<T>(n) {
            Ok(layout) => layout,
            Err(_) => panic!("allocation of {} x {} bytes overflows", n, mem::size_of::<T>()),
        }
    }

    /// Uninitialized storage for `n` values of `T`
    pub fn allocate(&self, n: usize, gil: &GilGuard) -> NonNull<T> {
        let layout = Self::layout(n);
        if layout.size() == 0 {
            return NonNull::dangling();
        }

        let raw = if n == 1 {
            gil.pool().alloc(layout)
        } else {
            gil.pool().note_bulk_alloc();
            if layout.align() <= MALLOC_ALIGN {
                NonNull::new(unsafe { libc::malloc(layout.size()) } as *mut u8)
            } else {
                NonNull::new(unsafe { std::alloc::alloc(layout) })
            }
        };

        match raw {
            Some(ptr) => ptr.cast(),
            None => std::alloc::handle_alloc_error(layout),
        }
    }

    /// Release storage without dropping its contents
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` with the same `n`, and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize, gil: &GilGuard) {
        let layout = Self::layout(n);
        if layout.size() == 0 {
            return;
        }

        if n == 1 {
            gil.pool().free(ptr.cast(), layout);
        } else {
            gil.pool().note_bulk_release();
            if layout.align() <= MALLOC_ALIGN {
                libc::free(ptr.as_ptr() as *mut libc::c_void);
            } else {
                std::alloc::dealloc(ptr.as_ptr() as *mut u8, layout);
            }
        }
    }

    /// Drop the value at `ptr`, then release its single-object storage
    ///
    /// # Safety
    ///
    /// `ptr` must hold an initialized `T` from `allocate(1, ..)`.
    pub unsafe fn dispose(&self, ptr: NonNull<T>, gil: &GilGuard) {
        ptr::drop_in_place(ptr.as_ptr());
        self.deallocate(ptr, 1, gil);
    }
}

impl<T> Default for ScopedAllocator<T> {
    fn default() -> Self {
        ScopedAllocator::new()
    }
}

/// Growable array whose storage comes from [`ScopedAllocator`]
///
/// Growing and freeing take a `&GilGuard`; reading and removing do not.
pub struct GilVec<T> {
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
}

// Safety: GilVec owns its elements like Vec does
unsafe impl<T: Send> Send for GilVec<T> {}
unsafe impl<T: Sync> Sync for GilVec<T> {}

impl<T> GilVec<T> {
    const MIN_CAP: usize = 4;

    pub const fn new() -> Self {
        GilVec { ptr: NonNull::dangling(), len: 0, cap: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn push(&mut self, value: T, gil: &GilGuard) {
        if self.len == self.cap {
            self.grow(gil);
        }
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(unsafe { self.ptr.as_ptr().add(self.len).read() })
    }

    /// Move every element out, leaving this vector empty with its storage kept
    pub fn take_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(v) = self.pop() {
            out.push(v);
        }
        out.reverse();
        out
    }

    fn grow(&mut self, gil: &GilGuard) {
        let alloc = ScopedAllocator::<T>::new();
        let new_cap = if self.cap == 0 { Self::MIN_CAP } else { self.cap * 2 };
        let new_ptr = alloc.allocate(new_cap, gil);
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
            if self.cap > 0 {
                alloc.deallocate(self.ptr, self.cap, gil);
            }
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
    }
}

impl<T> Default for GilVec<T> {
    fn default() -> Self {
        GilVec::new()
    }
}

impl<T> Drop for GilVec<T> {
    fn drop(&mut self) {
        // Elements may take the lock themselves while dropping.
        while let Some(v) = self.pop() {
            drop(v);
        }
        if self.cap > 0 {
            let gil = Gil::ensure();
            unsafe { ScopedAllocator::<T>::new().deallocate(self.ptr, self.cap, &gil) };
        }
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for GilVec<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
