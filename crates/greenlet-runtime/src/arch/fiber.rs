//! Fibers: one saved call stack each
//!
//! A fiber runs its entry function on a private stack. From anywhere inside
//! that function, however deep, [`Suspender::suspend`] hands control back to
//! whoever called [`Fiber::resume`]. Fibers never resume each other; the
//! switch engine drives them all from the thread's original stack.

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::NonNull;
use std::rc::Rc;

use generator::{Gn, LocalGenerator, Scope};
use greenlet_core::kwarn;

/// Outcome of one `resume`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// The fiber called `suspend` and can be resumed again
    Suspended,
    /// The entry function returned
    Finished,
}

/// The entry's generator scope, lifetimes erased. Valid only while the
/// entry function runs.
type ScopePtr = NonNull<Scope<'static, 'static, (), ()>>;

/// State reachable from both sides of the stack boundary
struct Shared {
    /// Yields to the resumer. Points into the fiber's own stack; set only
    /// while the entry function is live.
    suspend: Cell<Option<ScopePtr>>,
    cancelling: Cell<bool>,
    started: Cell<bool>,
    finished: Cell<bool>,
}

struct Inner {
    gen: RefCell<Option<LocalGenerator<'static, (), ()>>>,
    shared: Rc<Shared>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping a suspended generator unwinds its stack; let the entry
        // know so it does not swallow the unwind.
        self.shared.cancelling.set(true);
    }
}

/// A saved call stack. Clones share the same stack.
#[derive(Clone)]
pub struct Fiber {
    inner: Rc<Inner>,
}

/// What the entry function can see about its own fiber
pub struct FiberContext<'a> {
    shared: &'a Shared,
}

impl FiberContext<'_> {
    /// True while the fiber is being force-unwound. A panic caught in this
    /// state must be resumed, not handled.
    #[inline]
    pub fn is_cancelling(&self) -> bool {
        self.shared.cancelling.get()
    }
}

/// Handle used to suspend a running fiber
#[derive(Clone)]
pub struct Suspender {
    shared: Rc<Shared>,
}

impl Suspender {
    /// Return control to the resumer. Must be called on the fiber's own
    /// stack. Returns false (without suspending) if the fiber is not live.
    pub fn suspend(&self) -> bool {
        match self.shared.suspend.get() {
            Some(mut scope) => {
                // Safety: the pointer is set only while the generator body,
                // which owns the scope, is on the stack.
                unsafe { scope.as_mut().yield_with(()) };
                true
            }
            None => false,
        }
    }
}

impl Fiber {
    /// Create a fiber with a stack of `stack_size` bytes. Nothing runs
    /// until the first `resume`.
    pub fn new<F>(stack_size: usize, entry: F) -> Fiber
    where
        F: FnOnce(&FiberContext<'_>) + 'static,
    {
        let shared = Rc::new(Shared {
            suspend: Cell::new(None),
            cancelling: Cell::new(false),
            started: Cell::new(false),
            finished: Cell::new(false),
        });

        let words = stack_size / mem::size_of::<usize>();
        let body = Rc::clone(&shared);
        let gen = Gn::<()>::new_scoped_opt_local(words, move |mut scope| {
            // Cleared by the guard below, before `scope` goes out of scope.
            let erased: ScopePtr = NonNull::from(&mut scope).cast();

            body.suspend.set(Some(erased));
            body.started.set(true);

            struct ClearOnExit<'s>(&'s Shared);
            impl Drop for ClearOnExit<'_> {
                fn drop(&mut self) {
                    self.0.suspend.set(None);
                    self.0.finished.set(true);
                }
            }
            let _guard = ClearOnExit(&body);

            entry(&FiberContext { shared: &body });
        });

        Fiber {
            inner: Rc::new(Inner { gen: RefCell::new(Some(gen)), shared }),
        }
    }

    /// Run the fiber until it suspends or finishes
    ///
    /// Calling this on a finished or released fiber returns `Finished`.
    pub fn resume(&self) -> FiberStatus {
        {
            let mut gen = self.inner.gen.borrow_mut();
            match gen.as_mut() {
                Some(g) if !g.is_done() => {
                    g.resume();
                }
                _ => {}
            }
        }
        self.status()
    }

    pub fn status(&self) -> FiberStatus {
        if self.is_finished() {
            FiberStatus::Finished
        } else {
            FiberStatus::Suspended
        }
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.inner.shared.started.get()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.shared.finished.get()
    }

    /// True when a suspended stack exists that someone has to release
    #[inline]
    pub fn is_live(&self) -> bool {
        self.is_started() && !self.is_finished()
    }

    pub fn suspender(&self) -> Suspender {
        Suspender { shared: Rc::clone(&self.inner.shared) }
    }

    /// Force-unwind the stack now, running destructors on it
    ///
    /// Must be called from outside the fiber.
    pub fn unwind(&self) {
        self.inner.shared.cancelling.set(true);
        let gen = match self.inner.gen.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                kwarn!("fiber unwind requested while it is running; ignored");
                return;
            }
        };
        drop(gen);
        self.inner.shared.suspend.set(None);
        self.inner.shared.finished.set(true);
    }

    /// Give up the stack without running anything on it
    ///
    /// Destructors of values living on that stack never run and its memory
    /// is leaked. Used when the owning thread is going away.
    pub fn abandon(&self) {
        if let Ok(mut slot) = self.inner.gen.try_borrow_mut() {
            if let Some(gen) = slot.take() {
                mem::forget(gen);
            }
        }
        self.inner.shared.suspend.set(None);
        self.inner.shared.finished.set(true);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("started", &self.is_started())
            .field("finished", &self.is_finished())
            .finish()
    }
}
