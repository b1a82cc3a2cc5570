//! # greenlet-core
//!
//! Platform-agnostic building blocks for the greenlet runtime.
//!
//! Nothing here switches stacks. This crate provides the host object model
//! the runtime sits on (intrusive reference counts, a global execution
//! lock, a scoped allocator), the three reference-ownership wrappers, and
//! the shared vocabulary types: ids, run states, errors and payloads.
//!
//! ## Modules
//!
//! - `id` - greenlet identifier
//! - `state` - run-state enum
//! - `thread` - OS thread identity usable during thread teardown
//! - `error` - `GreenletError`, `Failure`
//! - `object` - object header and `ObjectKind`
//! - `refs` - `Borrowed`, `Owned`, `OutParam`
//! - `alloc` - small-object pool, `ScopedAllocator`, `GilVec`
//! - `gil` - the global execution lock
//! - `pending` - per-thread pending-failure slot
//! - `args` - switch payloads
//! - `spinlock` - bookkeeping spinlock
//! - `kprint` - leveled logging macros
//! - `env` - environment variable helpers

pub mod id;
pub mod state;
pub mod thread;
pub mod error;
pub mod object;
pub mod refs;
pub mod alloc;
pub mod gil;
pub mod pending;
pub mod args;
pub mod spinlock;
pub mod kprint;
pub mod env;

pub use id::GreenletId;
pub use state::GreenletState;
pub use thread::ThreadIdent;
pub use error::{Failure, FailureKind, GreenletError, GreenletResult};
pub use object::{Extends, ObjectHeader, ObjectKind};
pub use refs::{AnyObject, Borrowed, Object, OutParam, Owned};
pub use alloc::{GilVec, PoolStats, ScopedAllocator, SmallObjectPool};
pub use gil::{Gil, GilGuard};
pub use args::{Args, Payload};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_opt};

/// Runtime defaults
pub mod constants {
    /// Default fiber stack size (1 MiB)
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

    /// Smallest stack a fiber may be given
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Default bound on parent-chain walks
    pub const DEFAULT_MAX_NESTING_DEPTH: usize = 1_048_576;

    /// No greenlet sentinel value
    pub const GREENLET_NONE: u32 = u32::MAX;
}
