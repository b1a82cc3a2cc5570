//! Per-OS-thread greenlet registry
//!
//! One [`ThreadState`] per thread owns the main greenlet, tracks which node
//! is running, and decides when a node's stack may be released. Stacks are
//! only released at a safe point: on the thread's original stack, with no
//! fiber executing and no other release in progress. Anything released
//! elsewhere is queued on the deferred list (same thread) or on the foreign
//! inbox (other threads) and drained at the next safe point.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use greenlet_core::{
    kdebug, ktrace, Gil, GilVec, GreenletError, GreenletResult, GreenletState, Owned, Payload,
    SpinLock, ThreadIdent,
};

use crate::arch::{Fiber, Suspender};
use crate::node::{BorrowedGreenlet, GreenletNode, MainGreenlet, RunFn, ThreadBound};

/// Per-thread counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Completed `register_switch` calls
    pub switches: u64,
    /// Fibers created
    pub started: u64,
    /// Fibers whose run function returned
    pub finished: u64,
    /// Suspended stacks force-unwound
    pub released: u64,
    /// Nodes queued for deferred release
    pub deferred: u64,
    /// Queued nodes processed by a drain
    pub drained: u64,
    /// Stacks given up at thread teardown
    pub abandoned: u64,
}

/// What a fiber leaves behind when it hands control back to the driver
pub(crate) enum Outgoing {
    /// Switch to `target`, delivering `payload`
    Switch { target: Owned<GreenletNode>, payload: Payload },
    /// The run function finished with this result
    Return(Payload),
}

/// Registry entry for a node created on this thread. Not counted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct NodeEntry(NonNull<GreenletNode>);

// Safety: only dereferenced with the registry lock held, and a node removes
// its entry under that lock before it is freed.
unsafe impl Send for NodeEntry {}

struct ThreadInner {
    current: Owned<GreenletNode>,
    running_fiber: bool,
    releasing: bool,
    driving: bool,
    outgoing: Option<Outgoing>,
    deferred: GilVec<Owned<GreenletNode>>,
    nodes: HashSet<NodeEntry>,
    stats: ThreadStats,
}

/// Greenlet bookkeeping for one OS thread
pub struct ThreadState {
    thread: ThreadIdent,
    main: Owned<MainGreenlet>,
    inner: SpinLock<ThreadInner>,
    foreign: SegQueue<Owned<GreenletNode>>,
    closed: AtomicBool,
}

impl ThreadState {
    /// Fresh state for the calling thread, with its main greenlet running
    pub fn new() -> Arc<ThreadState> {
        let thread = ThreadIdent::current();
        let ts = Arc::new_cyclic(|weak| {
            let main = Owned::new(MainGreenlet::new(thread, weak.clone()));
            let current = main.clone().upcast::<GreenletNode>();
            ThreadState {
                thread,
                main,
                inner: SpinLock::new(ThreadInner {
                    current,
                    running_fiber: false,
                    releasing: false,
                    driving: false,
                    outgoing: None,
                    deferred: GilVec::new(),
                    nodes: HashSet::new(),
                    stats: ThreadStats::default(),
                }),
                foreign: SegQueue::new(),
                closed: AtomicBool::new(false),
            }
        });
        kdebug!("thread state created for {}, main greenlet {}", thread, ts.main.id());
        ts
    }

    #[inline]
    pub fn thread(&self) -> ThreadIdent {
        self.thread
    }

    pub fn main(&self) -> Owned<MainGreenlet> {
        self.main.clone()
    }

    pub fn main_node(&self) -> Owned<GreenletNode> {
        self.main.clone().upcast()
    }

    /// The node currently running on this thread
    pub fn current(&self) -> Owned<GreenletNode> {
        self.inner.lock().current.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ThreadStats {
        self.inner.lock().stats
    }

    /// Number of nodes waiting for deferred release
    pub fn deferred_len(&self) -> usize {
        self.inner.lock().deferred.len() + self.foreign.len()
    }

    /// True while a fiber (not the thread's original stack) is executing
    pub fn in_fiber(&self) -> bool {
        self.inner.lock().running_fiber
    }

    /// Main-stack code that must not start a switch is running: a forced
    /// unwind, or a destructor called from inside the driver loop
    pub(crate) fn is_busy(&self) -> bool {
        let inner = self.inner.lock();
        inner.releasing || (inner.driving && !inner.running_fiber)
    }

    /// Mark the driver loop as running until the guard drops
    pub(crate) fn enter_driver(&self) -> GreenletResult<DriverGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.driving && !inner.running_fiber {
            return Err(GreenletError::SwitchDuringRelease.raise());
        }
        inner.driving = true;
        Ok(DriverGuard(self))
    }

    /// Nodes created here and not yet freed
    pub fn tracked_nodes(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// Create an unstarted node whose parent is `parent`, or the current node
    pub fn create_greenlet(
        &self,
        run: RunFn,
        parent: Option<BorrowedGreenlet<'_>>,
    ) -> GreenletResult<Owned<GreenletNode>> {
        if self.is_closed() {
            return Err(GreenletError::ThreadExited.raise());
        }
        let parent = match parent {
            Some(p) => {
                if p.thread() != self.thread {
                    return Err(GreenletError::CrossThreadParent { parent: p.id() }.raise());
                }
                p.to_owned()
            }
            None => self.current(),
        };
        let node = Owned::new(GreenletNode::new(run, parent, self.thread, self.main.downgrade_state()));
        self.inner.lock().nodes.insert(NodeEntry(NonNull::from(&*node)));
        ktrace!("greenlet {} created on {}", node.id(), self.thread);
        Ok(node)
    }

    /// Make `target` the running node. Returns the node that was running.
    ///
    /// The caller drops the returned reference after all locks are released.
    pub fn register_switch(&self, target: &Owned<GreenletNode>) -> GreenletResult<Owned<GreenletNode>> {
        if target.thread() != self.thread {
            return Err(GreenletError::CrossThreadSwitch { target: target.id() }.raise());
        }
        let _gil = Gil::ensure();
        let mut inner = self.inner.lock();
        let prev = std::mem::replace(&mut inner.current, target.clone());
        if prev.state() == GreenletState::Running {
            prev.set_state(GreenletState::Suspended);
        }
        target.set_state(GreenletState::Running);
        inner.stats.switches += 1;
        ktrace!("switch {} -> {}", prev.id(), target.id());
        Ok(prev)
    }

    /// A stack may be released right now from the calling context
    pub(crate) fn can_release_now(&self) -> bool {
        if !self.thread.is_current() || self.is_closed() {
            return false;
        }
        let inner = self.inner.lock();
        !inner.running_fiber && !inner.releasing
    }

    /// Queue `node` for release at the next safe point
    pub fn defer_delete(&self, node: Owned<GreenletNode>) {
        kdebug!("greenlet {}: release deferred", node.id());
        let gil = Gil::ensure();
        let mut inner = self.inner.lock();
        inner.deferred.push(node, &gil);
        inner.stats.deferred += 1;
    }

    pub(crate) fn push_foreign(&self, node: Owned<GreenletNode>) {
        self.foreign.push(node);
    }

    /// Release every queued node, if this is a safe point
    ///
    /// Releasing can queue more nodes; they are handled in the same call.
    pub fn drain_deferred(&self) {
        if !self.thread.is_current() {
            return;
        }
        loop {
            let batch = {
                let gil = Gil::ensure();
                let mut inner = self.inner.lock();
                if inner.running_fiber || inner.releasing {
                    return;
                }
                while let Some(node) = self.foreign.pop() {
                    inner.deferred.push(node, &gil);
                    inner.stats.deferred += 1;
                }
                let batch = inner.deferred.take_all();
                inner.stats.drained += batch.len() as u64;
                batch
            };
            if batch.is_empty() {
                return;
            }
            for node in batch {
                self.release_node(node);
            }
        }
    }

    /// Force-unwind `node`'s stack and mark it dead, then drop the reference
    pub(crate) fn release_node(&self, node: Owned<GreenletNode>) {
        let fiber = {
            let mut inner = node.inner.lock();
            inner.state = GreenletState::Dead;
            inner.fiber.take()
        };

        if let Some(bound) = fiber {
            self.inner.lock().releasing = true;
            match bound.into_inner() {
                Ok(fiber) => {
                    kdebug!("greenlet {}: unwinding stack", node.id());
                    fiber.unwind();
                }
                Err(bound) => std::mem::forget(bound),
            }
            let stale = {
                let mut inner = self.inner.lock();
                inner.releasing = false;
                inner.stats.released += 1;
                inner.outgoing.take()
            };
            drop(stale);
        }
        drop(node);
    }

    /// Install a fresh fiber on an unstarted node
    pub(crate) fn attach_fiber(&self, node: &Owned<GreenletNode>, fiber: Fiber) {
        node.inner.lock().fiber = Some(ThreadBound::new(fiber));
        self.inner.lock().stats.started += 1;
    }

    /// Detach the fiber of a node whose run function returned
    pub(crate) fn finish_node(&self, node: &Owned<GreenletNode>) -> Option<ThreadBound<Fiber>> {
        let fiber = {
            let mut inner = node.inner.lock();
            inner.state = GreenletState::Dead;
            inner.fiber.take()
        };
        self.inner.lock().stats.finished += 1;
        fiber
    }

    /// Drop the registry entry of a node about to be freed
    pub(crate) fn forget_node(&self, node: &GreenletNode) {
        self.inner.lock().nodes.remove(&NodeEntry(NonNull::from(node)));
    }

    /// Unregister a node freed after teardown and give up its stack
    pub(crate) fn retire_node(&self, node: &GreenletNode) {
        let mut inner = self.inner.lock();
        inner.nodes.remove(&NodeEntry(NonNull::from(node)));
        if node.abandon_stack() {
            inner.stats.abandoned += 1;
        }
    }

    pub(crate) fn set_running_fiber(&self, running: bool) {
        self.inner.lock().running_fiber = running;
    }

    pub(crate) fn post(&self, out: Outgoing) {
        let stale = self.inner.lock().outgoing.replace(out);
        drop(stale);
    }

    pub(crate) fn take_outgoing(&self) -> Option<Outgoing> {
        self.inner.lock().outgoing.take()
    }

    /// Suspender for the current node's stack, if it has one
    pub(crate) fn current_suspender(&self) -> Option<Suspender> {
        let current = self.current();
        let suspender = current
            .inner
            .lock()
            .fiber
            .as_ref()
            .and_then(ThreadBound::get)
            .map(Fiber::suspender);
        suspender
    }

    /// Shut the thread's tree down
    ///
    /// Every node created here is marked dead: live stacks are abandoned
    /// without running more code on them, pending run functions and inbox
    /// payloads are dropped. Queued nodes are dropped and the main greenlet
    /// is marked dead. Idempotent.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (abandoned, leftovers) = {
            let mut inner = self.inner.lock();
            let mut abandoned = 0u64;
            let mut leftovers = Vec::new();
            for NodeEntry(ptr) in inner.nodes.drain() {
                // Safety: entries are removed under this lock before their
                // node is freed
                let node = unsafe { ptr.as_ref() };
                if node.abandon_stack() {
                    abandoned += 1;
                }
                let mut n = node.inner.lock();
                n.state = GreenletState::Dead;
                leftovers.push((n.run.take(), n.inbox.take()));
            }
            inner.stats.abandoned += abandoned;
            (abandoned, leftovers)
        };
        drop(leftovers);

        let queued = {
            let gil = Gil::ensure();
            let mut inner = self.inner.lock();
            while let Some(node) = self.foreign.pop() {
                inner.deferred.push(node, &gil);
            }
            inner.releasing = false;
            inner.running_fiber = false;
            let stale = inner.outgoing.take();
            (inner.deferred.take_all(), stale)
        };
        drop(queued);

        let main = self.main_node();
        let prev = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.current, main.clone())
        };
        drop(prev);
        main.set_state(GreenletState::Dead);
        kdebug!("thread state for {} torn down, {} stacks abandoned", self.thread, abandoned);
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Clears the driver flag when the driver loop exits, however it exits
pub(crate) struct DriverGuard<'a>(&'a ThreadState);

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().driving = false;
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("thread", &self.thread)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenlet_core::Args;

    fn passthrough() -> RunFn {
        Box::new(|args: Args| Ok(args))
    }

    #[test]
    fn test_new_state_runs_main() {
        let ts = ThreadState::new();
        let cur = ts.current();
        assert!(cur.is_main());
        assert_eq!(cur.state(), GreenletState::Running);
        assert!(!ts.in_fiber());
        assert_eq!(ts.stats(), ThreadStats::default());
    }

    #[test]
    fn test_register_switch_moves_running_pointer() {
        let ts = ThreadState::new();
        let g = ts.create_greenlet(passthrough(), None).unwrap();
        let prev = ts.register_switch(&g).unwrap();
        assert!(prev.is_main());
        assert_eq!(prev.state(), GreenletState::Suspended);
        assert_eq!(g.state(), GreenletState::Running);
        assert!(ts.current().ptr_eq(&g));
        drop(prev);

        let back = ts.register_switch(&ts.main_node()).unwrap();
        assert!(back.ptr_eq(&g));
        assert_eq!(g.state(), GreenletState::Suspended);
        assert_eq!(ts.stats().switches, 2);
        ts.teardown();
    }

    #[test]
    fn test_register_switch_rejects_foreign_node() {
        let other = std::thread::spawn(|| {
            let ts = ThreadState::new();
            let g = ts.create_greenlet(passthrough(), None).unwrap();
            ts.teardown();
            g
        })
        .join()
        .unwrap();

        let ts = ThreadState::new();
        greenlet_core::pending::clear();
        let err = ts.register_switch(&other).unwrap_err();
        assert!(matches!(err, GreenletError::CrossThreadSwitch { .. }));
        assert!(ts.current().is_main());
        greenlet_core::pending::clear();
    }

    #[test]
    fn test_create_with_foreign_parent_fails() {
        let foreign_main = std::thread::spawn(|| ThreadState::new().main_node()).join().unwrap();
        let ts = ThreadState::new();
        greenlet_core::pending::clear();
        let err = ts.create_greenlet(passthrough(), Some((&foreign_main).into())).unwrap_err();
        assert!(matches!(err, GreenletError::CrossThreadParent { .. }));
        greenlet_core::pending::clear();
    }

    #[test]
    fn test_teardown_marks_main_dead() {
        let ts = ThreadState::new();
        ts.teardown();
        assert!(ts.is_closed());
        assert!(ts.main().is_dead());
        ts.teardown();
        greenlet_core::pending::clear();
        assert_eq!(
            ts.create_greenlet(passthrough(), None).unwrap_err(),
            GreenletError::ThreadExited
        );
        greenlet_core::pending::clear();
    }

    struct Canary(Arc<AtomicBool>);

    impl Drop for Canary {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_tracked_nodes_follow_node_lifetime() {
        let ts = ThreadState::new();
        assert_eq!(ts.tracked_nodes(), 0);
        let a = ts.create_greenlet(passthrough(), None).unwrap();
        let b = ts.create_greenlet(passthrough(), Some((&a).into())).unwrap();
        assert_eq!(ts.tracked_nodes(), 2);
        drop(a);
        // still held as b's parent
        assert_eq!(ts.tracked_nodes(), 2);
        drop(b);
        assert_eq!(ts.tracked_nodes(), 0);
        ts.teardown();
    }

    #[test]
    fn test_unstarted_node_dead_after_thread_exit() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let g = std::thread::spawn(move || {
            let ts = ThreadState::new();
            let canary = Canary(flag);
            let run: RunFn = Box::new(move |args: Args| {
                let _keep = &canary;
                Ok(args)
            });
            ts.create_greenlet(run, None).unwrap()
        })
        .join()
        .unwrap();

        assert!(g.is_dead());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(g.inner.lock().run.is_none());
    }

    #[test]
    fn test_teardown_kills_unstarted_nodes() {
        let ts = ThreadState::new();
        let g = ts.create_greenlet(passthrough(), None).unwrap();
        assert_eq!(g.state(), GreenletState::Unstarted);
        ts.teardown();
        assert!(g.is_dead());
        assert_eq!(ts.tracked_nodes(), 0);
        assert_eq!(ts.stats().abandoned, 0);
        drop(g);
    }

    #[test]
    fn test_driver_is_not_reentrant_on_main_stack() {
        let ts = ThreadState::new();
        greenlet_core::pending::clear();
        {
            let _driver = ts.enter_driver().unwrap();
            assert!(ts.is_busy());
            let err = ts.enter_driver().err();
            assert_eq!(err, Some(GreenletError::SwitchDuringRelease));

            // a fiber resumed by the driver may run its own switches
            ts.set_running_fiber(true);
            assert!(!ts.is_busy());
            ts.set_running_fiber(false);
        }
        assert!(!ts.is_busy());
        assert!(ts.enter_driver().is_ok());
        greenlet_core::pending::clear();
        ts.teardown();
    }
}
