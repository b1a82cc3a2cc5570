//! # greenlet-runtime
//!
//! Stack switching and per-thread bookkeeping for greenlets.
//!
//! This crate provides:
//! - Fibers: separately allocated stacks that can be suspended and resumed
//! - Greenlet nodes and the main greenlet anchoring each thread's tree
//! - Per-thread state: the running node, deferred stack release, teardown
//! - The switch engine: `switch`, `throw`, `set_parent`
//! - Runtime configuration (stack size, nesting bound)

pub mod config;
pub mod arch;
pub mod node;
pub mod thread_state;
pub mod switch;
pub mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use arch::{Fiber, FiberContext, FiberStatus, Suspender};
pub use node::{BorrowedGreenlet, GreenletNode, MainGreenlet, RunFn, ThreadBound};
pub use thread_state::{ThreadState, ThreadStats};
pub use switch::{set_parent, switch, throw};
pub use tls::{current_greenlet_id, is_in_greenlet, thread_state, try_thread_state};
