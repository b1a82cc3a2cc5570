//! Greenlet identifier type

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Next identifier handed out by `GreenletId::next`. Zero is never used.
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Unique identifier for a greenlet node
///
/// Identifiers are process-wide and never reused while the counter lasts.
/// The maximum value (u32::MAX) is reserved as a sentinel for "no greenlet".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GreenletId(u32);

impl GreenletId {
    /// Sentinel value indicating no greenlet
    pub const NONE: GreenletId = GreenletId(u32::MAX);

    /// Create a GreenletId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        GreenletId(id)
    }

    /// Allocate a fresh identifier
    pub fn next() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        // Wrapping into the sentinel would alias NONE; skip it.
        if id == u32::MAX {
            return GreenletId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        }
        GreenletId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this is a valid greenlet ID
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<GreenletId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for GreenletId {
    #[inline]
    fn from(id: u32) -> Self {
        GreenletId(id)
    }
}

impl From<GreenletId> for u32 {
    #[inline]
    fn from(id: GreenletId) -> Self {
        id.0
    }
}

impl fmt::Debug for GreenletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "GreenletId(NONE)")
        } else {
            write!(f, "GreenletId({})", self.0)
        }
    }
}

impl fmt::Display for GreenletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for GreenletId {
    fn default() -> Self {
        GreenletId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greenlet_id_basics() {
        let id = GreenletId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert!(!id.is_none());
        assert!(id.is_some());
    }

    #[test]
    fn test_greenlet_id_none() {
        let none = GreenletId::NONE;
        assert!(none.is_none());
        assert!(!none.is_some());
        assert_eq!(none.to_option(), None);
        assert_eq!(format!("{}", none), "none");
    }

    #[test]
    fn test_next_is_unique() {
        let a = GreenletId::next();
        let b = GreenletId::next();
        assert_ne!(a, b);
        assert!(a.is_some() && b.is_some());
    }
}
