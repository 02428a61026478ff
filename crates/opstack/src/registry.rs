//! Process-wide identifiers for labels, locals and roots.
//!
//! Handles are plain ids drawn from one atomic counter, so nested roots built
//! while an enclosing root is still open (or builders on other threads) never
//! hand out colliding ids.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A forward branch target inside a root under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    pub(crate) id: u32,
}

/// A frame storage slot inside a root under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local {
    pub(crate) id: u32,
}

/// A finished root, returned by [`Builder::end_root`](crate::Builder::end_root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootRef {
    pub(crate) id: u32,
}

impl Label {
    pub(crate) fn fresh() -> Self {
        Self { id: next_id() }
    }
}

impl Local {
    pub(crate) fn fresh() -> Self {
        Self { id: next_id() }
    }
}

impl RootRef {
    pub(crate) fn fresh() -> Self {
        Self { id: next_id() }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label#{}", self.id)
    }
}

impl fmt::Display for Local {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.id)
    }
}

impl fmt::Display for RootRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root#{}", self.id)
    }
}
