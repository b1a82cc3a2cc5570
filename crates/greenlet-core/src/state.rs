//! Greenlet run-state type

use core::fmt;

/// Run state of a greenlet node
///
/// ```text
/// Unstarted ──► Running ◄──► Suspended
///     │            │             │
///     └────────────┴─────────────┴──► Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GreenletState {
    /// Created, no stack yet
    Unstarted = 0,

    /// Currently executing on its thread
    Running = 1,

    /// Switched away, stack saved
    Suspended = 2,

    /// Finished, force-unwound or abandoned. Terminal.
    Dead = 3,
}

impl GreenletState {
    /// A switch may target a node in this state
    #[inline]
    pub const fn is_switchable(&self) -> bool {
        matches!(self, GreenletState::Unstarted | GreenletState::Suspended)
    }

    /// The node has a stack that has been entered at least once and not finished
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, GreenletState::Running | GreenletState::Suspended)
    }

    #[inline]
    pub const fn is_dead(&self) -> bool {
        matches!(self, GreenletState::Dead)
    }

    /// Check whether moving from `self` to `next` is a legal transition
    pub const fn can_transition_to(&self, next: GreenletState) -> bool {
        use GreenletState::*;
        matches!(
            (*self, next),
            (Unstarted, Running)
                | (Unstarted, Dead)
                | (Running, Suspended)
                | (Running, Dead)
                | (Suspended, Running)
                | (Suspended, Dead)
        )
    }
}

impl From<u8> for GreenletState {
    fn from(v: u8) -> Self {
        match v {
            0 => GreenletState::Unstarted,
            1 => GreenletState::Running,
            2 => GreenletState::Suspended,
            _ => GreenletState::Dead,
        }
    }
}

impl From<GreenletState> for u8 {
    fn from(state: GreenletState) -> u8 {
        state as u8
    }
}

impl fmt::Display for GreenletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GreenletState::Unstarted => write!(f, "unstarted"),
            GreenletState::Running => write!(f, "running"),
            GreenletState::Suspended => write!(f, "suspended"),
            GreenletState::Dead => write!(f, "dead"),
        }
    }
}
