//! Error types for the greenlet runtime

use core::fmt;

use crate::id::GreenletId;
use crate::pending;

/// Result type for greenlet operations
pub type GreenletResult<T> = Result<T, GreenletError>;

/// Errors reported by the greenlet core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreenletError {
    /// An object expected to be a greenlet node (or some other kind) is not one
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Switch target is pinned to a different OS thread
    CrossThreadSwitch { target: GreenletId },

    /// Switch target has already died
    DeadTarget(GreenletId),

    /// A failure raised on the other side of a switch
    Propagated(Failure),

    /// New parent lives on a different OS thread
    CrossThreadParent { parent: GreenletId },

    /// New parent would make the parent chain cyclic
    ParentCycle { node: GreenletId },

    /// Parent change not allowed for this node
    InvalidParent(&'static str),

    /// Parent chain longer than the configured bound
    NestingTooDeep { limit: usize },

    /// The owning thread's state has been torn down
    ThreadExited,

    /// A switch was attempted while a stack is being force-unwound
    SwitchDuringRelease,

    /// Runtime already initialized
    AlreadyInitialized,

    /// Configuration rejected by validation
    InvalidConfig(&'static str),
}

impl GreenletError {
    /// Report this error on the thread's pending-failure slot (if that slot is
    /// empty) and hand it back for propagation.
    ///
    /// Every error leaving the core goes through here so the two reporting
    /// channels never disagree.
    #[must_use]
    pub fn raise(self) -> Self {
        pending::set_if_empty(&self);
        self
    }

    /// Short, stable name of the error kind
    pub fn kind_name(&self) -> &'static str {
        match self {
            GreenletError::TypeMismatch { .. } => "TypeMismatch",
            GreenletError::CrossThreadSwitch { .. } => "CrossThreadSwitch",
            GreenletError::DeadTarget(_) => "DeadTargetSwitch",
            GreenletError::Propagated(_) => "PropagatedFailure",
            GreenletError::CrossThreadParent { .. } => "CrossThreadParent",
            GreenletError::ParentCycle { .. } => "ParentCycle",
            GreenletError::InvalidParent(_) => "InvalidParent",
            GreenletError::NestingTooDeep { .. } => "NestingTooDeep",
            GreenletError::ThreadExited => "ThreadExited",
            GreenletError::SwitchDuringRelease => "SwitchDuringRelease",
            GreenletError::AlreadyInitialized => "AlreadyInitialized",
            GreenletError::InvalidConfig(_) => "InvalidConfig",
        }
    }
}

impl fmt::Display for GreenletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GreenletError::TypeMismatch { expected, found } => {
                write!(f, "expected a {}, got {}", expected, found)
            }
            GreenletError::CrossThreadSwitch { target } => {
                write!(f, "cannot switch to greenlet {} on a different thread", target)
            }
            GreenletError::DeadTarget(id) => write!(f, "cannot switch to dead greenlet {}", id),
            GreenletError::Propagated(failure) => write!(f, "{}", failure),
            GreenletError::CrossThreadParent { parent } => {
                write!(f, "parent greenlet {} is on a different thread", parent)
            }
            GreenletError::ParentCycle { node } => {
                write!(f, "setting parent of greenlet {} would create a cycle", node)
            }
            GreenletError::InvalidParent(why) => write!(f, "invalid parent: {}", why),
            GreenletError::NestingTooDeep { limit } => {
                write!(f, "greenlet parent chain exceeds {} links", limit)
            }
            GreenletError::ThreadExited => write!(f, "owning thread has exited"),
            GreenletError::SwitchDuringRelease => {
                write!(f, "cannot switch while a greenlet stack is being released")
            }
            GreenletError::AlreadyInitialized => write!(f, "runtime already initialized"),
            GreenletError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
        }
    }
}

impl std::error::Error for GreenletError {}

impl From<Failure> for GreenletError {
    fn from(failure: Failure) -> Self {
        GreenletError::Propagated(failure)
    }
}

/// Kind of a failure carried across a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Raised explicitly by user code
    Raised,
    /// A panic caught at the greenlet boundary
    Panic,
    /// Request for the receiving greenlet to exit; delivered as a normal return
    Exit,
    /// A core error converted into a payload
    Error,
}

/// A failure travelling as a switch payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    message: String,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Failure { kind: FailureKind::Raised, message: message.into() }
    }

    /// The greenlet-exit marker
    pub fn exit() -> Self {
        Failure { kind: FailureKind::Exit, message: String::from("greenlet exit") }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Failure { kind: FailureKind::Panic, message: message.into() }
    }

    /// Build from a caught panic payload
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("greenlet panicked")
        };
        Failure::panic(message)
    }

    #[inline]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        self.kind == FailureKind::Exit
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Raised => write!(f, "{}", self.message),
            FailureKind::Panic => write!(f, "panic: {}", self.message),
            FailureKind::Exit => write!(f, "GreenletExit"),
            FailureKind::Error => write!(f, "error: {}", self.message),
        }
    }
}

impl From<&GreenletError> for Failure {
    fn from(err: &GreenletError) -> Self {
        match err {
            GreenletError::Propagated(failure) => failure.clone(),
            other => Failure {
                kind: FailureKind::Error,
                message: format!("{}: {}", other.kind_name(), other),
            },
        }
    }
}

impl From<GreenletError> for Failure {
    fn from(err: GreenletError) -> Self {
        match err {
            GreenletError::Propagated(failure) => failure,
            other => Failure::from(&other),
        }
    }
}
