//! Refresh lifecycle states and full-refresh de-duplication.

use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of one refresh cycle for one partial. A new setting change
/// always starts over at `PendingRefresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    /// Waiting for the debounce window to close.
    PendingRefresh,
    /// Part of a dispatched batch.
    InFlight,
    Applied,
    Failed,
}

/// Lets exactly one full refresh through until reset.
#[derive(Debug, Default)]
pub struct FullRefreshGate {
    triggered: AtomicBool,
}

impl FullRefreshGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first call only.
    pub fn trigger(&self) -> bool {
        !self.triggered.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Re-arm, as after the reloaded preview reports ready.
    pub fn reset(&self) {
        self.triggered.store(false, Ordering::SeqCst);
    }
}
