//! Greenlet nodes
//!
//! A [`GreenletNode`] is one call stack inside an OS thread together with its
//! parent link and run state. Each thread's tree is anchored by a
//! [`MainGreenlet`], a node that also knows its [`ThreadState`].
//!
//! Parent links are counted references pointing upward only, so the tree
//! has no cycles and a live node's chain always reaches its main greenlet.

use std::any::TypeId;
use std::mem::{self, ManuallyDrop};
use std::ops::Deref;
use std::sync::{Arc, Weak};

use greenlet_core::{
    kdebug, kwarn, AnyObject, Args, Borrowed, Extends, GreenletError, GreenletId,
    GreenletResult, GreenletState, ObjectKind, Owned, Payload, SpinLock, ThreadIdent,
};

use crate::arch::Fiber;
use crate::config;
use crate::thread_state::ThreadState;

/// The function a greenlet runs when first switched into
pub type RunFn = Box<dyn FnOnce(Args) -> GreenletResult<Args> + Send>;

/// A value usable only on the OS thread that created it
///
/// May be moved and shared across threads; `get` and `into_inner` only hand
/// the value out on the owner thread. Dropping it elsewhere leaks the value.
pub struct ThreadBound<T> {
    owner: ThreadIdent,
    value: ManuallyDrop<T>,
}

// Safety: the value is only ever touched on `owner`
unsafe impl<T> Send for ThreadBound<T> {}
unsafe impl<T> Sync for ThreadBound<T> {}

impl<T> ThreadBound<T> {
    pub fn new(value: T) -> Self {
        ThreadBound { owner: ThreadIdent::current(), value: ManuallyDrop::new(value) }
    }

    #[inline]
    pub fn owner(&self) -> ThreadIdent {
        self.owner
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.owner.is_current() {
            Some(&self.value)
        } else {
            None
        }
    }

    pub fn into_inner(self) -> Result<T, Self> {
        if !self.owner.is_current() {
            return Err(self);
        }
        let mut this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the value is moved out once
        Ok(unsafe { ManuallyDrop::take(&mut this.value) })
    }
}

impl<T> Drop for ThreadBound<T> {
    fn drop(&mut self) {
        if self.owner.is_current() {
            unsafe { ManuallyDrop::drop(&mut self.value) };
        } else {
            kwarn!(
                "leaking a {} owned by {} dropped on {}",
                std::any::type_name::<T>(),
                self.owner,
                ThreadIdent::current()
            );
        }
    }
}

pub(crate) struct NodeInner {
    pub(crate) state: GreenletState,
    pub(crate) parent: Option<Owned<GreenletNode>>,
    pub(crate) run: Option<RunFn>,
    /// Present exactly while the node has a live stack
    pub(crate) fiber: Option<ThreadBound<Fiber>>,
    /// Payload waiting for the node when it resumes
    pub(crate) inbox: Option<Payload>,
}

/// One greenlet
#[repr(C)]
pub struct GreenletNode {
    id: GreenletId,
    thread: ThreadIdent,
    main: bool,
    /// Registry this node is tracked in; reached without walking parents
    owner: Weak<ThreadState>,
    pub(crate) inner: SpinLock<NodeInner>,
}

impl GreenletNode {
    pub(crate) fn new(
        run: RunFn,
        parent: Owned<GreenletNode>,
        thread: ThreadIdent,
        owner: Weak<ThreadState>,
    ) -> Self {
        GreenletNode {
            id: GreenletId::next(),
            thread,
            main: false,
            owner,
            inner: SpinLock::new(NodeInner {
                state: GreenletState::Unstarted,
                parent: Some(parent),
                run: Some(run),
                fiber: None,
                inbox: None,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> GreenletId {
        self.id
    }

    /// OS thread this node is pinned to
    #[inline]
    pub fn thread(&self) -> ThreadIdent {
        self.thread
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.main
    }

    pub fn state(&self) -> GreenletState {
        self.inner.lock().state
    }

    pub fn is_dead(&self) -> bool {
        self.state().is_dead()
    }

    pub fn is_started(&self) -> bool {
        self.state() != GreenletState::Unstarted
    }

    /// True while a suspended or running stack exists
    pub fn has_stack(&self) -> bool {
        self.inner.lock().fiber.is_some()
    }

    pub fn parent(&self) -> Option<Owned<GreenletNode>> {
        self.inner.lock().parent.clone()
    }

    pub(crate) fn set_state(&self, state: GreenletState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            debug_assert!(
                inner.state.can_transition_to(state),
                "greenlet {}: {} -> {}",
                self.id,
                inner.state,
                state
            );
            if !inner.state.is_dead() {
                inner.state = state;
            }
        }
    }

    /// The enclosing main greenlet, if this node is one
    pub fn as_main(&self) -> Option<&MainGreenlet> {
        if self.main {
            // Safety: main nodes are only ever built as the first field of a
            // `#[repr(C)] MainGreenlet`
            Some(unsafe { &*(self as *const GreenletNode as *const MainGreenlet) })
        } else {
            None
        }
    }

    /// Walk parent links from this node, calling `visit` on each ancestor
    /// (not on `self`). Stops when `visit` returns `Some`.
    ///
    /// Fails with `NestingTooDeep` after the configured number of links. The
    /// error is not raised; callers decide whether it escapes.
    pub(crate) fn walk_ancestors<R>(
        &self,
        visit: impl FnMut(&Owned<GreenletNode>) -> Option<R>,
    ) -> GreenletResult<Option<R>> {
        self.walk_ancestors_within(config::get().max_nesting_depth, visit)
    }

    pub(crate) fn walk_ancestors_within<R>(
        &self,
        limit: usize,
        mut visit: impl FnMut(&Owned<GreenletNode>) -> Option<R>,
    ) -> GreenletResult<Option<R>> {
        let mut cursor = self.parent();
        let mut steps = 0usize;
        while let Some(node) = cursor {
            steps += 1;
            if steps > limit {
                return Err(GreenletError::NestingTooDeep { limit });
            }
            if let Some(found) = visit(&node) {
                return Ok(Some(found));
            }
            cursor = node.parent();
        }
        Ok(None)
    }

    /// Owner found through the main greenlet at the root of the parent
    /// chain, giving up after `limit` links. Not raised.
    pub(crate) fn resolve_owner(&self, limit: usize) -> GreenletResult<Arc<ThreadState>> {
        let weak = match self.as_main() {
            Some(main) => main.thread_state.clone(),
            None => self
                .walk_ancestors_within(limit, |n| n.as_main().map(|m| m.thread_state.clone()))?
                .ok_or(GreenletError::ThreadExited)?,
        };
        weak.upgrade().ok_or(GreenletError::ThreadExited)
    }

    /// The thread state owning this node, found through the main greenlet
    /// at the root of the parent chain.
    ///
    /// `ThreadExited` if that thread's state is gone.
    pub fn owner_state(&self) -> GreenletResult<Arc<ThreadState>> {
        self.resolve_owner(config::get().max_nesting_depth)
            .map_err(GreenletError::raise)
    }

    /// Nearest ancestor that is not dead
    pub(crate) fn live_ancestor(&self) -> GreenletResult<Option<Owned<GreenletNode>>> {
        self.walk_ancestors(|n| if n.is_dead() { None } else { Some(n.clone()) })
    }

    /// Take the stack away and give it up without running anything on it
    pub(crate) fn abandon_stack(&self) -> bool {
        let fiber = {
            let mut inner = self.inner.lock();
            inner.state = GreenletState::Dead;
            inner.fiber.take()
        };
        match fiber {
            Some(bound) => {
                match bound.into_inner() {
                    Ok(fiber) => fiber.abandon(),
                    Err(bound) => mem::forget(bound),
                }
                true
            }
            None => false,
        }
    }
}

impl ObjectKind for GreenletNode {
    const NAME: &'static str = "greenlet";

    fn on_release(this: Borrowed<'_, Self>) -> bool {
        let owner = this.owner.upgrade();
        if !this.has_stack() {
            if let Some(ts) = owner {
                ts.forget_node(&this);
            }
            return true;
        }

        let ts = match owner {
            Some(ts) if !ts.is_closed() => ts,
            Some(ts) => {
                kdebug!("greenlet {}: owner thread closed, abandoning stack", this.id());
                ts.retire_node(&this);
                return true;
            }
            None => {
                kdebug!("greenlet {}: owner thread gone, abandoning stack", this.id());
                this.abandon_stack();
                return true;
            }
        };

        if !this.thread().is_current() {
            kdebug!("greenlet {}: released on foreign {}", this.id(), ThreadIdent::current());
            ts.push_foreign(this.to_owned());
            return false;
        }

        if ts.can_release_now() {
            ts.release_node(this.to_owned());
            ts.drain_deferred();
        } else {
            ts.defer_delete(this.to_owned());
        }
        false
    }
}

/// The node anchoring an OS thread's greenlet tree
#[repr(C)]
pub struct MainGreenlet {
    node: GreenletNode,
    thread_state: Weak<ThreadState>,
}

const _: () = assert!(mem::align_of::<MainGreenlet>() == mem::align_of::<GreenletNode>());

impl MainGreenlet {
    pub(crate) fn new(thread: ThreadIdent, thread_state: Weak<ThreadState>) -> Self {
        MainGreenlet {
            node: GreenletNode {
                id: GreenletId::next(),
                thread,
                main: true,
                owner: thread_state.clone(),
                inner: SpinLock::new(NodeInner {
                    state: GreenletState::Running,
                    parent: None,
                    run: None,
                    fiber: None,
                    inbox: None,
                }),
            },
            thread_state,
        }
    }

    pub fn thread_state(&self) -> Option<Arc<ThreadState>> {
        self.thread_state.upgrade()
    }

    pub(crate) fn downgrade_state(&self) -> Weak<ThreadState> {
        self.thread_state.clone()
    }
}

impl Deref for MainGreenlet {
    type Target = GreenletNode;

    fn deref(&self) -> &GreenletNode {
        &self.node
    }
}

impl ObjectKind for MainGreenlet {
    const NAME: &'static str = "main greenlet";

    fn family() -> TypeId {
        TypeId::of::<GreenletNode>()
    }
}

// Safety: repr(C), node first, alignment asserted above, family is GreenletNode
unsafe impl Extends<GreenletNode> for MainGreenlet {}

/// A borrowed reference known to be a greenlet node (plain or main)
#[derive(Clone, Copy)]
pub struct BorrowedGreenlet<'a>(Borrowed<'a, GreenletNode>);

impl<'a> BorrowedGreenlet<'a> {
    #[inline]
    pub fn as_borrowed(&self) -> Borrowed<'a, GreenletNode> {
        self.0
    }

    #[inline]
    pub fn to_owned(&self) -> Owned<GreenletNode> {
        self.0.to_owned()
    }

    pub fn ptr_eq(&self, other: &Owned<GreenletNode>) -> bool {
        self.0.ptr_eq(&other.borrow())
    }
}

impl<'a> TryFrom<Borrowed<'a, AnyObject>> for BorrowedGreenlet<'a> {
    type Error = GreenletError;

    fn try_from(obj: Borrowed<'a, AnyObject>) -> GreenletResult<Self> {
        obj.downcast_family::<GreenletNode>().map(BorrowedGreenlet)
    }
}

impl<'a> From<&'a Owned<GreenletNode>> for BorrowedGreenlet<'a> {
    fn from(owned: &'a Owned<GreenletNode>) -> Self {
        BorrowedGreenlet(owned.borrow())
    }
}

impl<'a> From<Borrowed<'a, GreenletNode>> for BorrowedGreenlet<'a> {
    fn from(b: Borrowed<'a, GreenletNode>) -> Self {
        BorrowedGreenlet(b)
    }
}

impl<'a> Deref for BorrowedGreenlet<'a> {
    type Target = GreenletNode;

    fn deref(&self) -> &GreenletNode {
        &self.0
    }
}

impl std::fmt::Debug for GreenletNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreenletNode")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("main", &self.main)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::switch;
    use crate::tls;
    use greenlet_core::pending;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn passthrough() -> RunFn {
        Box::new(|args: Args| Ok(args))
    }

    #[test]
    fn test_borrowed_greenlet_rejects_non_node() {
        pending::clear();
        let obj = Owned::new(42i64).into_any();
        let err = BorrowedGreenlet::try_from(obj.borrow()).err().unwrap();
        assert_eq!(err, GreenletError::TypeMismatch { expected: "greenlet", found: "i64" });
        assert!(pending::occurred());
        pending::clear();
    }

    #[test]
    fn test_borrowed_greenlet_accepts_nodes() {
        let ts = tls::thread_state().unwrap();
        let main = ts.main().into_any();
        let g = BorrowedGreenlet::try_from(main.borrow()).unwrap();
        assert!(g.is_main());
        assert!(g.ptr_eq(&ts.current()));

        let node = ts.create_greenlet(passthrough(), None).unwrap();
        let any = node.clone().into_any();
        let b = BorrowedGreenlet::try_from(any.borrow()).unwrap();
        assert_eq!(b.id(), node.id());
        assert!(b.ptr_eq(&node));
        assert!(!b.is_main());
    }

    #[test]
    fn test_owner_state_through_parent_chain() {
        let ts = tls::thread_state().unwrap();
        let a = ts.create_greenlet(passthrough(), None).unwrap();
        let b = ts.create_greenlet(passthrough(), Some((&a).into())).unwrap();
        let found = b.owner_state().unwrap();
        assert!(Arc::ptr_eq(&found, &ts));
        assert!(b.parent().unwrap().ptr_eq(&a));
        assert!(a.parent().unwrap().is_main());
    }

    #[test]
    fn test_owner_lookup_bounded_by_depth() {
        let ts = tls::thread_state().unwrap();
        let a = ts.create_greenlet(passthrough(), None).unwrap();
        let b = ts.create_greenlet(passthrough(), Some((&a).into())).unwrap();

        assert_eq!(b.resolve_owner(1).err(), Some(GreenletError::NestingTooDeep { limit: 1 }));
        assert!(Arc::ptr_eq(&b.resolve_owner(2).unwrap(), &ts));
        let found = b.walk_ancestors_within(1, |n| if n.is_main() { Some(()) } else { None });
        assert_eq!(found, Err(GreenletError::NestingTooDeep { limit: 1 }));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_of_deep_node_unregisters_it() {
        let ts = tls::thread_state().unwrap();
        let main = ts.main_node();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));

        let a = ts.create_greenlet(passthrough(), None).unwrap();
        let b = ts
            .create_greenlet(
                Box::new(move |_: Args| -> GreenletResult<Args> {
                    let _flag = flag;
                    let ts = tls::thread_state()?;
                    switch(&ts, (&main).into(), Ok(Args::new()))?;
                    Ok(Args::new())
                }),
                Some((&a).into()),
            )
            .unwrap();
        switch(&ts, (&b).into(), Ok(Args::new())).unwrap();
        assert!(b.has_stack());
        // Too deep for a one-link walk; release must not depend on it.
        assert!(b.resolve_owner(1).is_err());

        let tracked = ts.tracked_nodes();
        let released = ts.stats().released;
        drop(b);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(ts.tracked_nodes(), tracked - 1);
        assert_eq!(ts.stats().released, released + 1);
        drop(a);
        assert_eq!(ts.tracked_nodes(), tracked - 2);
    }

    #[test]
    fn test_thread_bound_only_on_owner() {
        let bound = Arc::new(ThreadBound::new(String::from("here")));
        assert_eq!(bound.get().map(String::as_str), Some("here"));
        let b2 = Arc::clone(&bound);
        let seen = std::thread::spawn(move || b2.get().is_some()).join().unwrap();
        assert!(!seen);
        let bound = Arc::try_unwrap(bound).ok().unwrap();
        assert_eq!(bound.into_inner().ok().unwrap(), "here");
    }
}
