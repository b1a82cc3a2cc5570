//! # greenlet - stackful coroutines with explicit switching
//!
//! A greenlet is a call stack of its own inside an OS thread. Control moves
//! between greenlets only when code asks for it with [`Greenlet::switch`];
//! there is no scheduler and no preemption.
//!
//! ## Features
//!
//! - **Symmetric switching**: any greenlet can switch to any other live
//!   greenlet of the same thread, passing [`Args`] along
//! - **Parent chain**: a greenlet that finishes hands its result to its
//!   nearest live ancestor
//! - **Failure transport**: errors and panics travel across switches as
//!   [`Failure`] values
//! - **Safe release**: a suspended greenlet that is dropped gets its stack
//!   unwound, immediately if possible, otherwise at the next safe point
//!
//! ## Quick Start
//!
//! ```ignore
//! use greenlet::{getcurrent, Args, Greenlet};
//!
//! let main = getcurrent()?;
//! let g = Greenlet::new(move |args| {
//!     let x: i64 = args.value(0).unwrap_or(0);
//!     let more = main.switch(Args::new().arg(x + 1))?;
//!     Ok(more)
//! })?;
//!
//! let first = g.switch(Args::new().arg(1i64))?;   // 2
//! let last = g.switch(Args::new().arg("bye"))?;   // "bye", g is now dead
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        Greenlet::new(), switch(), throw(), getcurrent()     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Switch Engine                            │
//! │    validation, driver loop on the main stack, delivery      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Thread   │      │ Greenlet  │      │   Fiber   │
//!    │  State    │      │   Node    │      │  (stack)  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          └─────────┬─────────┘
//!                    ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │           Host objects (refcounts, GIL, pool)           │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use greenlet_core::{
    pending,
    AnyObject,
    Args,
    Borrowed,
    Failure,
    FailureKind,
    Gil,
    GreenletError,
    GreenletId,
    GreenletResult,
    GreenletState,
    Object,
    ObjectKind,
    OutParam,
    Owned,
    Payload,
};

// Re-export kprint macros for debug logging
pub use greenlet_core::{kdebug, kerror, kinfo, ktrace, kwarn};
pub use greenlet_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use greenlet_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use greenlet_runtime::{
    config,
    BorrowedGreenlet,
    GreenletNode,
    MainGreenlet,
    RuntimeConfig,
    ThreadState,
    ThreadStats,
};

use greenlet_runtime::{switch, tls};

/// Handle to one greenlet
///
/// Cloning the handle shares the greenlet. When the last handle (and every
/// other reference) to a suspended greenlet goes away, its stack is
/// unwound.
#[derive(Clone)]
pub struct Greenlet {
    node: Owned<GreenletNode>,
}

impl Greenlet {
    /// Create a greenlet whose parent is the current greenlet
    ///
    /// `run` executes on the greenlet's own stack when it is first switched
    /// into, and receives that switch's arguments. Its result goes to the
    /// nearest live ancestor.
    pub fn new<F>(run: F) -> GreenletResult<Greenlet>
    where
        F: FnOnce(Args) -> GreenletResult<Args> + Send + 'static,
    {
        let ts = tls::thread_state()?;
        let node = ts.create_greenlet(Box::new(run), None)?;
        Ok(Greenlet { node })
    }

    /// Create a greenlet under an explicit parent of this thread
    pub fn with_parent<F>(run: F, parent: &Greenlet) -> GreenletResult<Greenlet>
    where
        F: FnOnce(Args) -> GreenletResult<Args> + Send + 'static,
    {
        let ts = tls::thread_state()?;
        let node = ts.create_greenlet(Box::new(run), Some((&parent.node).into()))?;
        Ok(Greenlet { node })
    }

    /// Wrap an object known to be a greenlet node
    ///
    /// Fails with `TypeMismatch` for any other kind of object.
    pub fn from_object(obj: Borrowed<'_, AnyObject>) -> GreenletResult<Greenlet> {
        let node = BorrowedGreenlet::try_from(obj)?;
        Ok(Greenlet { node: node.to_owned() })
    }

    /// Switch to this greenlet
    ///
    /// Returns whatever the caller is handed when control comes back.
    pub fn switch(&self, args: Args) -> GreenletResult<Args> {
        let ts = tls::thread_state()?;
        switch::switch(&ts, (&self.node).into(), Ok(args))
    }

    /// Raise `failure` inside this greenlet
    ///
    /// An unstarted greenlet dies without running. `Failure::exit()` ends
    /// the greenlet quietly unless it handles the error.
    pub fn throw(&self, failure: Failure) -> GreenletResult<Args> {
        let ts = tls::thread_state()?;
        switch::throw(&ts, (&self.node).into(), failure)
    }

    #[inline]
    pub fn id(&self) -> GreenletId {
        self.node.id()
    }

    pub fn state(&self) -> GreenletState {
        self.node.state()
    }

    pub fn is_dead(&self) -> bool {
        self.node.is_dead()
    }

    pub fn is_started(&self) -> bool {
        self.node.is_started()
    }

    /// True while the greenlet has a stack (running or suspended)
    pub fn is_active(&self) -> bool {
        self.node.has_stack() || (self.node.is_main() && !self.node.is_dead())
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.node.is_main()
    }

    pub fn parent(&self) -> Option<Greenlet> {
        self.node.parent().map(|node| Greenlet { node })
    }

    /// Move this greenlet under another parent of the same thread
    pub fn set_parent(&self, parent: &Greenlet) -> GreenletResult<()> {
        switch::set_parent((&self.node).into(), (&parent.node).into())
    }

    /// A new counted reference to the underlying object
    pub fn as_object(&self) -> Object {
        self.node.clone().into_any()
    }

    pub fn node(&self) -> &Owned<GreenletNode> {
        &self.node
    }
}

impl PartialEq for Greenlet {
    fn eq(&self, other: &Self) -> bool {
        self.node.ptr_eq(&other.node)
    }
}

impl Eq for Greenlet {}

impl std::fmt::Debug for Greenlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Greenlet")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("main", &self.is_main())
            .finish()
    }
}

/// The greenlet running on this thread
pub fn getcurrent() -> GreenletResult<Greenlet> {
    let ts = tls::thread_state()?;
    Ok(Greenlet { node: ts.current() })
}

/// This thread's main greenlet
pub fn main_greenlet() -> GreenletResult<Greenlet> {
    let ts = tls::thread_state()?;
    Ok(Greenlet { node: ts.main_node() })
}

/// Counters for this thread's greenlet activity
pub fn thread_stats() -> GreenletResult<ThreadStats> {
    Ok(tls::thread_state()?.stats())
}

/// Get the current greenlet's ID
///
/// Returns `GreenletId::NONE` if this thread never used greenlets.
#[inline]
pub fn current_id() -> GreenletId {
    tls::current_greenlet_id()
}

/// Check if code is running on a greenlet's own stack
#[inline]
pub fn is_in_greenlet() -> bool {
    tls::is_in_greenlet()
}

/// Release queued greenlet stacks now, if this is a safe point
pub fn collect() -> GreenletResult<()> {
    tls::thread_state()?.drain_deferred();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Canary(Arc<AtomicUsize>);

    impl Drop for Canary {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Greenlet that parks itself once (holding a canary), then returns
    fn parked(drops: &Arc<AtomicUsize>) -> Greenlet {
        let main = main_greenlet().unwrap();
        let canary = Canary(Arc::clone(drops));
        let g = Greenlet::new(move |_| {
            let _canary = canary;
            main.switch(Args::new())?;
            Ok(Args::new())
        })
        .unwrap();
        g.switch(Args::new()).unwrap();
        assert_eq!(g.state(), GreenletState::Suspended);
        g
    }

    #[test]
    fn test_ping_pong() {
        let main = getcurrent().unwrap();
        assert!(main.is_main());
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        let m = main.clone();
        let g = Greenlet::new(move |args| {
            l.lock().unwrap().push(("x", args.kwarg_value::<i64>("x").unwrap()));
            let back = m.switch(Args::new().kwarg("y", 2i64))?;
            l.lock().unwrap().push(("z", back.kwarg_value::<i64>("z").unwrap()));
            Ok(Args::new())
        })
        .unwrap();

        let got = g.switch(Args::new().kwarg("x", 1i64)).unwrap();
        assert_eq!(got.kwarg_value::<i64>("y"), Some(2));
        assert_eq!(getcurrent().unwrap(), main);

        g.switch(Args::new().kwarg("z", 3i64)).unwrap();
        assert!(g.is_dead());
        assert_eq!(*log.lock().unwrap(), vec![("x", 1), ("z", 3)]);
    }

    #[test]
    fn test_completion_reverts_to_main() {
        let main = getcurrent().unwrap();
        let inside = Arc::new(Mutex::new(None));
        let i = Arc::clone(&inside);
        let g = Greenlet::new(move |_| {
            *i.lock().unwrap() = Some(getcurrent()?.id());
            Ok(Args::new().arg("done"))
        })
        .unwrap();

        assert_eq!(g.state(), GreenletState::Unstarted);
        assert!(!g.is_started());
        let out = g.switch(Args::new()).unwrap();
        assert_eq!(out.value::<&'static str>(0), Some("done"));
        assert_eq!(*inside.lock().unwrap(), Some(g.id()));
        assert!(g.is_dead());
        assert!(!g.is_active());
        assert_eq!(getcurrent().unwrap(), main);
        assert_eq!(current_id(), main.id());
    }

    #[test]
    fn test_self_switch() {
        let me = getcurrent().unwrap();
        let out = me.switch(Args::new().arg(3i32).kwarg("k", true)).unwrap();
        assert_eq!(out.value::<i32>(0), Some(3));
        assert_eq!(out.kwarg_value::<bool>("k"), Some(true));
        assert_eq!(me.state(), GreenletState::Running);
    }

    #[test]
    fn test_dead_target() {
        let g = Greenlet::new(|a| Ok(a)).unwrap();
        g.switch(Args::new()).unwrap();
        pending::clear();
        let err = g.switch(Args::new()).unwrap_err();
        assert_eq!(err, GreenletError::DeadTarget(g.id()));
        assert_eq!(pending::take_failure().map(|f| f.kind()), Some(FailureKind::Error));
    }

    #[test]
    fn test_cross_thread_switch_refused() {
        let g = Greenlet::new(|a| Ok(a)).unwrap();
        let g2 = g.clone();
        let err = std::thread::spawn(move || g2.switch(Args::new()).unwrap_err())
            .join()
            .unwrap();
        assert!(matches!(err, GreenletError::CrossThreadSwitch { .. }));
        assert_eq!(g.state(), GreenletState::Unstarted);
        g.switch(Args::new()).unwrap();
        assert!(g.is_dead());
    }

    #[test]
    fn test_panic_propagates_to_parent() {
        let g = Greenlet::new(|_| -> GreenletResult<Args> { panic!("inside greenlet") }).unwrap();
        pending::clear();
        match g.switch(Args::new()) {
            Err(GreenletError::Propagated(f)) => {
                assert_eq!(f.kind(), FailureKind::Panic);
                assert!(f.message().contains("inside greenlet"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(g.is_dead());
        pending::clear();
    }

    #[test]
    fn test_throw_into_unstarted() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let g = Greenlet::new(move |a| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(a)
        })
        .unwrap();
        let out = g.throw(Failure::exit()).unwrap();
        assert!(out.is_empty());
        assert!(g.is_dead());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exit_caught_inside() {
        let main = getcurrent().unwrap();
        let g = Greenlet::new(move |_| match main.switch(Args::new()) {
            Err(GreenletError::Propagated(f)) if f.is_exit() => Ok(Args::new().arg("cleaned up")),
            other => other,
        })
        .unwrap();
        g.switch(Args::new()).unwrap();
        let out = g.throw(Failure::exit()).unwrap();
        assert_eq!(out.value::<&'static str>(0), Some("cleaned up"));
        assert!(!pending::occurred());
    }

    #[test]
    fn test_parent_and_reparent() {
        let main = getcurrent().unwrap();
        let a = Greenlet::new(|x| Ok(x)).unwrap();
        let b = Greenlet::with_parent(|_| Ok(Args::new().arg(9i64)), &a).unwrap();
        assert_eq!(b.parent(), Some(a.clone()));
        assert_eq!(a.parent(), Some(main.clone()));
        assert!(main.parent().is_none());

        pending::clear();
        assert!(matches!(a.set_parent(&b), Err(GreenletError::ParentCycle { .. })));
        pending::clear();

        // b finishes into a; a echoes it back to main.
        let out = b.switch(Args::new()).unwrap();
        assert_eq!(out.value::<i64>(0), Some(9));
        assert!(a.is_dead());
        assert!(b.is_dead());
    }

    #[test]
    fn test_object_round_trip() {
        let g = Greenlet::new(|x| Ok(x)).unwrap();
        let obj = g.as_object();
        assert_eq!(obj.type_name(), "greenlet");
        assert_eq!(Greenlet::from_object(obj.borrow()).unwrap(), g);

        let main = main_greenlet().unwrap().as_object();
        assert!(Greenlet::from_object(main.borrow()).unwrap().is_main());

        pending::clear();
        let not = Owned::new(String::from("nope")).into_any();
        assert!(matches!(
            Greenlet::from_object(not.borrow()),
            Err(GreenletError::TypeMismatch { expected: "greenlet", .. })
        ));
        let mut out = OutParam::<AnyObject>::new();
        assert!(pending::fetch(&mut out));
        assert!(out.take().is_some());
    }

    #[test]
    fn test_drop_on_main_stack_releases_now() {
        let drops = Arc::new(AtomicUsize::new(0));
        let before = thread_stats().unwrap();
        let g = parked(&drops);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(g);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        let after = thread_stats().unwrap();
        assert_eq!(after.released - before.released, 1);
        assert_eq!(after.deferred, before.deferred);
    }

    #[test]
    fn test_drop_inside_greenlet_is_deferred() {
        let drops = Arc::new(AtomicUsize::new(0));
        let victim = parked(&drops);
        let before = thread_stats().unwrap();

        let d = Arc::clone(&drops);
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        let g = Greenlet::new(move |_| {
            drop(victim);
            let queued = tls::thread_state()?.deferred_len();
            *o.lock().unwrap() = Some((d.load(Ordering::SeqCst), queued));
            Ok(Args::new())
        })
        .unwrap();
        g.switch(Args::new()).unwrap();

        // Still alive while the other greenlet ran, released once back on main.
        assert_eq!(*observed.lock().unwrap(), Some((0, 1)));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        let after = thread_stats().unwrap();
        assert_eq!(after.deferred - before.deferred, 1);
        assert_eq!(after.drained - before.drained, 1);
        assert_eq!(after.released - before.released, 1);
        assert_eq!(tls::thread_state().unwrap().deferred_len(), 0);
    }

    #[test]
    fn test_drop_on_foreign_thread_waits_for_owner() {
        let drops = Arc::new(AtomicUsize::new(0));
        let g = parked(&drops);
        std::thread::spawn(move || drop(g)).join().unwrap();

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(tls::thread_state().unwrap().deferred_len(), 1);
        collect().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_exit_abandons_suspended() {
        let drops = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&drops);
        let (g_state, stats) = std::thread::spawn(move || {
            let g = parked(&d);
            (g, thread_stats().unwrap())
        })
        .join()
        .unwrap();
        assert_eq!(stats.started, 1);
        assert!(g_state.is_dead());
        // Abandoned stacks never run their destructors.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_thread_exit_kills_unstarted() {
        let drops = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&drops);
        let g = std::thread::spawn(move || {
            let canary = Canary(d);
            Greenlet::new(move |a| {
                let _keep = &canary;
                Ok(a)
            })
            .unwrap()
        })
        .join()
        .unwrap();
        assert!(g.is_dead());
        assert_eq!(g.state(), GreenletState::Dead);
        // The run function never ran but was dropped with the thread.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
