//! Signing identity monitor
//!
//! Tracks which identity the ledger currently signs with. Each poll feeds
//! the latest observation in; the monitor reports transitions so the engine
//! can log them once instead of every tick.

use alloy_primitives::Address;

/// Transition produced by [`IdentityMonitor::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    /// First identity ever seen.
    Initial(Address),
    /// Identity switched from one address to another.
    Changed { previous: Address, current: Address },
    /// Same identity as last time (or available again after a pending spell).
    Unchanged,
    /// No identity selected, first tick in this state.
    Pending,
    /// No identity selected, already reported.
    StillPending,
}

#[derive(Debug, Default)]
pub struct IdentityMonitor {
    current: Option<Address>,
    suspended: bool,
}

impl IdentityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last identity seen. Kept while the ledger reports none selected.
    pub fn current(&self) -> Option<Address> {
        self.current
    }

    pub fn observe(&mut self, seen: Option<Address>) -> IdentityChange {
        let Some(seen) = seen else {
            if self.suspended {
                return IdentityChange::StillPending;
            }
            self.suspended = true;
            return IdentityChange::Pending;
        };

        self.suspended = false;
        match self.current.replace(seen) {
            None => IdentityChange::Initial(seen),
            Some(previous) if previous != seen => IdentityChange::Changed {
                previous,
                current: seen,
            },
            Some(_) => IdentityChange::Unchanged,
        }
    }
}
