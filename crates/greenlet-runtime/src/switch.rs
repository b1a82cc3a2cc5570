//! The switch engine
//!
//! Fibers are asymmetric: they only ever yield back to whoever resumed them.
//! Symmetric greenlet switching is built on top with a driver loop that runs
//! on the thread's original stack:
//!
//! ```text
//!   main stack                         fiber stacks
//!   ----------                         ------------
//!   switch(g) ──► drive ──resume──►  g: switch(h) posts Switch{h}, suspends
//!                   ◄───────────────
//!                 drive ──resume──►  h: returns, posts Return(value)
//!                   ◄───────────────
//!                 drive: h dead, retarget to h's nearest live ancestor
//! ```
//!
//! A fiber requesting a switch stores the request on its thread state and
//! suspends; the driver picks it up, updates the bookkeeping and resumes
//! the next target. When the target is the main greenlet the driver returns
//! to its caller.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use greenlet_core::{
    kdebug, ktrace, kwarn, pending, Args, Failure, GreenletError, GreenletResult, GreenletState,
    Owned, Payload,
};

use crate::arch::{Fiber, FiberContext, FiberStatus};
use crate::config;
use crate::node::{BorrowedGreenlet, GreenletNode, RunFn, ThreadBound};
use crate::thread_state::{Outgoing, ThreadState};

/// Transfer control to `target`, delivering `payload`
///
/// Returns what the calling greenlet receives when control comes back to
/// it. A failure payload arriving here surfaces as
/// `GreenletError::Propagated`.
pub fn switch(
    ts: &Arc<ThreadState>,
    target: BorrowedGreenlet<'_>,
    payload: Payload,
) -> GreenletResult<Args> {
    validate(ts, &target)?;

    let current = ts.current();
    if target.ptr_eq(&current) {
        ktrace!("greenlet {}: switch to self", current.id());
        return deliver(payload);
    }
    drop(current);

    let target = target.to_owned();
    if ts.in_fiber() {
        switch_from_fiber(ts, target, payload)
    } else {
        let received = drive(ts, target, payload)?;
        deliver(received)
    }
}

/// Switch to `target` with a failure as the payload
pub fn throw(ts: &Arc<ThreadState>, target: BorrowedGreenlet<'_>, failure: Failure) -> GreenletResult<Args> {
    switch(ts, target, Err(failure))
}

/// Re-parent `node` under `parent`
pub fn set_parent(node: BorrowedGreenlet<'_>, parent: BorrowedGreenlet<'_>) -> GreenletResult<()> {
    if node.is_main() {
        return Err(GreenletError::InvalidParent("cannot reparent a main greenlet").raise());
    }
    if parent.thread() != node.thread() {
        return Err(GreenletError::CrossThreadParent { parent: parent.id() }.raise());
    }
    if parent.ptr_eq(&node.to_owned()) {
        return Err(GreenletError::ParentCycle { node: node.id() }.raise());
    }
    let cyclic = parent
        .walk_ancestors(|n| if node.ptr_eq(n) { Some(()) } else { None })
        .map_err(GreenletError::raise)?;
    if cyclic.is_some() {
        return Err(GreenletError::ParentCycle { node: node.id() }.raise());
    }

    let old = node.inner.lock().parent.replace(parent.to_owned());
    drop(old);
    Ok(())
}

fn validate(ts: &ThreadState, target: &BorrowedGreenlet<'_>) -> GreenletResult<()> {
    if ts.is_closed() {
        return Err(GreenletError::ThreadExited.raise());
    }
    if ts.is_busy() {
        return Err(GreenletError::SwitchDuringRelease.raise());
    }
    if target.thread() != ts.thread() {
        return Err(GreenletError::CrossThreadSwitch { target: target.id() }.raise());
    }
    if target.is_dead() {
        return Err(GreenletError::DeadTarget(target.id()).raise());
    }
    Ok(())
}

/// What the receiving side of a switch sees
///
/// A normal resume means any failure registered earlier was handled, so the
/// pending slot is cleared for the next one.
fn deliver(payload: Payload) -> GreenletResult<Args> {
    match payload {
        Ok(args) => {
            pending::clear();
            Ok(args)
        }
        Err(failure) => Err(GreenletError::Propagated(failure).raise()),
    }
}

/// A node that died of the exit marker hands its parent an empty result
fn exit_to_empty(payload: Payload) -> Payload {
    match payload {
        Err(failure) if failure.is_exit() => Ok(Args::new()),
        other => other,
    }
}

/// Fiber side: post the request, suspend, then read our inbox
fn switch_from_fiber(
    ts: &Arc<ThreadState>,
    target: Owned<GreenletNode>,
    payload: Payload,
) -> GreenletResult<Args> {
    let suspender = match ts.current_suspender() {
        Some(s) => s,
        None => return Err(GreenletError::ThreadExited.raise()),
    };

    ts.post(Outgoing::Switch { target, payload });
    if !suspender.suspend() {
        drop(ts.take_outgoing());
        return Err(GreenletError::ThreadExited.raise());
    }

    // Resumed by the driver; we are the current node again.
    let me = ts.current();
    let received = me.inner.lock().inbox.take();
    drop(me);
    deliver(received.unwrap_or_else(|| Ok(Args::new())))
}

/// Main-stack driver loop. Returns the payload for the main greenlet.
///
/// Destructors that run on the main stack inside the loop cannot start a
/// switch of their own; they get `SwitchDuringRelease`.
fn drive(ts: &Arc<ThreadState>, mut target: Owned<GreenletNode>, mut payload: Payload) -> GreenletResult<Payload> {
    let _driver = ts.enter_driver()?;
    loop {
        ts.drain_deferred();

        if target.is_main() {
            let prev = ts.register_switch(&target)?;
            drop(prev);
            return Ok(payload);
        }

        // A failure thrown into a node that never ran kills it; the failure
        // goes on to the node's parent.
        if target.state() == GreenletState::Unstarted && payload.is_err() {
            kdebug!("greenlet {}: killed before start", target.id());
            let run = {
                let mut inner = target.inner.lock();
                inner.state = GreenletState::Dead;
                inner.run.take()
            };
            drop(run);
            payload = exit_to_empty(payload);
            target = next_live(ts, &target);
            continue;
        }

        let fiber = match prepare(ts, &target, payload) {
            Ok(fiber) => fiber,
            Err(err) => {
                kdebug!("greenlet {}: cannot resume: {}", target.id(), err);
                payload = Err(Failure::from(err));
                target = ts.main_node();
                continue;
            }
        };
        let prev = ts.register_switch(&target)?;
        drop(prev);

        ts.set_running_fiber(true);
        let status = fiber.resume();
        ts.set_running_fiber(false);
        let out = ts.take_outgoing();

        match status {
            FiberStatus::Finished => {
                let done = ts.finish_node(&target);
                drop(done);
                drop(fiber);
                payload = match out {
                    Some(Outgoing::Return(result)) => exit_to_empty(result),
                    _ => Err(Failure::panic("greenlet finished without a result")),
                };
                ktrace!("greenlet {} finished", target.id());
                target = next_live(ts, &target);
            }
            FiberStatus::Suspended => {
                drop(fiber);
                match out {
                    Some(Outgoing::Switch { target: next, payload: p }) => {
                        target = next;
                        payload = p;
                    }
                    Some(Outgoing::Return(p)) => {
                        payload = exit_to_empty(p);
                        target = next_live(ts, &target);
                    }
                    None => {
                        payload = Ok(Args::new());
                        target = next_live(ts, &target);
                    }
                }
            }
        }
    }
}

/// Nearest live ancestor of `node`, falling back to the main greenlet
fn next_live(ts: &ThreadState, node: &GreenletNode) -> Owned<GreenletNode> {
    match node.live_ancestor() {
        Ok(Some(found)) => found,
        Ok(None) => ts.main_node(),
        Err(err) => {
            kwarn!("greenlet {}: {}, returning to main", node.id(), err);
            ts.main_node()
        }
    }
}

/// Get `target` ready to be resumed with `payload`
///
/// A suspended node gets the payload in its inbox. An unstarted node gets a
/// fresh fiber whose entry runs the node's function with the payload.
fn prepare(ts: &Arc<ThreadState>, target: &Owned<GreenletNode>, payload: Payload) -> GreenletResult<Fiber> {
    let existing = {
        let mut inner = target.inner.lock();
        let fiber = inner.fiber.as_ref().and_then(ThreadBound::get).cloned();
        match fiber {
            Some(fiber) => Ok((fiber, inner.inbox.replace(payload))),
            None => Err((inner.run.take(), payload)),
        }
    };

    match existing {
        Ok((fiber, stale)) => {
            drop(stale);
            Ok(fiber)
        }
        Err((Some(run), Ok(args))) => {
            let fiber = Fiber::new(config::get().stack_size, entry(Arc::downgrade(ts), run, args));
            ts.attach_fiber(target, fiber.clone());
            Ok(fiber)
        }
        Err((_, _)) => Err(GreenletError::DeadTarget(target.id())),
    }
}

/// Body of every greenlet fiber: run, catch, report
fn entry(
    ts: std::sync::Weak<ThreadState>,
    run: RunFn,
    args: Args,
) -> impl FnOnce(&FiberContext<'_>) + 'static {
    move |ctx: &FiberContext<'_>| {
        let result = match catch_unwind(AssertUnwindSafe(move || run(args))) {
            Ok(Ok(ret)) => Ok(ret),
            Ok(Err(err)) => Err(Failure::from(err)),
            Err(panic) => {
                if ctx.is_cancelling() {
                    resume_unwind(panic);
                }
                Err(Failure::from_panic(panic.as_ref()))
            }
        };
        if ctx.is_cancelling() {
            return;
        }
        if let Some(ts) = ts.upgrade() {
            ts.post(Outgoing::Return(result));
        }
    }
}
