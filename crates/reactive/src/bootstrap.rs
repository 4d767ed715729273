//! Immediate-result bootstrap timer.
//!
//! When a listener registers for a token whose result is already cached, it
//! should see that value without waiting for the next server transition. The
//! engine arms this timer, and at most one bootstrap pass is ever pending: all
//! registrations made before it fires are served by the same pass.

use std::cell::Cell;

/// State of the bootstrap timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootstrapState {
    /// No pass pending.
    #[default]
    Idle,
    /// A pass is deferred on the scheduler.
    Scheduled,
}

/// Coalescing timer for bootstrap passes.
#[derive(Debug, Default)]
pub struct BootstrapTimer {
    state: Cell<BootstrapState>,
}

impl BootstrapTimer {
    /// Creates an idle timer.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> BootstrapState {
        self.state.get()
    }

    /// Returns true while a pass is pending.
    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.state.get() == BootstrapState::Scheduled
    }

    /// Moves `Idle -> Scheduled`.
    ///
    /// Returns true if the caller must defer a new pass, false if one is
    /// already pending.
    pub fn arm(&self) -> bool {
        match self.state.get() {
            BootstrapState::Idle => {
                self.state.set(BootstrapState::Scheduled);
                true
            }
            BootstrapState::Scheduled => false,
        }
    }

    /// Moves `Scheduled -> Idle` when the pending pass starts.
    ///
    /// Returns false if nothing was pending.
    pub fn fire(&self) -> bool {
        self.state.replace(BootstrapState::Idle) == BootstrapState::Scheduled
    }
}
