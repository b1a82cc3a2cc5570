//! The global execution lock
//!
//! One process-wide lock, reentrant for the thread that holds it. Host
//! object allocation and release, and greenlet-tree bookkeeping, happen
//! with it held. It is never held across a stack transfer.
//!
//! The lock also guards [`HostState`], the shared small-object pool.

use core::cell::{RefCell, RefMut};
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::alloc::SmallObjectPool;
use crate::thread::ThreadIdent;

/// Process state protected by the global lock
pub struct HostState {
    pool: RefCell<SmallObjectPool>,
}

// Safety: only reachable through a `GilGuard`, so at most one thread touches it
unsafe impl Sync for HostState {}

/// The lock itself. Owner 0 means free.
pub struct Gil {
    owner: AtomicU64,
    depth: AtomicUsize,
    state: HostState,
}

static GIL: Gil = Gil {
    owner: AtomicU64::new(0),
    depth: AtomicUsize::new(0),
    state: HostState { pool: RefCell::new(SmallObjectPool::new()) },
};

impl Gil {
    /// Acquire the lock for the calling thread, or bump the depth if this
    /// thread already holds it.
    pub fn ensure() -> GilGuard {
        let me = ThreadIdent::current().as_u64();

        if GIL.owner.load(Ordering::Acquire) == me {
            GIL.depth.fetch_add(1, Ordering::Relaxed);
            return GilGuard { _not_send: PhantomData };
        }

        let mut spins = 0u32;
        loop {
            if GIL
                .owner
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            spins = spins.wrapping_add(1);
            if spins < 64 {
                for _ in 0..spins {
                    core::hint::spin_loop();
                }
            } else {
                std::thread::yield_now();
            }
        }
        GIL.depth.store(1, Ordering::Relaxed);
        GilGuard { _not_send: PhantomData }
    }

    /// True if the calling thread holds the lock
    #[inline]
    pub fn is_held() -> bool {
        GIL.owner.load(Ordering::Acquire) == ThreadIdent::current().as_u64()
    }

    /// Reentrancy depth of the calling thread, 0 if it does not hold the lock
    pub fn depth() -> usize {
        if Gil::is_held() {
            GIL.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}

/// Proof that the calling thread holds the global lock
///
/// Not `Send`: the guard must be dropped on the thread that acquired it.
pub struct GilGuard {
    _not_send: PhantomData<*const ()>,
}

impl GilGuard {
    /// The shared state this lock protects
    #[inline]
    pub fn host(&self) -> &'static HostState {
        &GIL.state
    }

    /// Borrow the small-object pool
    #[inline]
    pub fn pool(&self) -> RefMut<'static, SmallObjectPool> {
        self.host().pool.borrow_mut()
    }
}

impl Drop for GilGuard {
    fn drop(&mut self) {
        if GIL.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            GIL.owner.store(0, Ordering::Release);
        }
    }
}
