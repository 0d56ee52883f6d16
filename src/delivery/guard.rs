// Delivery guard
// Dedup against the last confirmed delivery plus a single in-flight slot

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::state::SharedState;

/// Why a guarded delivery was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Token equals the last confirmed delivery
    Duplicate,
    /// Another guarded delivery is running
    InFlight,
    /// Nothing to deliver
    EmptyToken,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SkipReason::Duplicate => "already delivered",
            SkipReason::InFlight => "delivery in flight",
            SkipReason::EmptyToken => "empty token",
        };
        f.write_str(reason)
    }
}

/// Held for the duration of a guarded delivery
///
/// Dropping the permit returns the guard to idle on every exit path.
#[derive(Debug)]
pub struct InFlightPermit {
    _permit: OwnedSemaphorePermit,
}

/// Guard decision for a candidate token
#[derive(Debug)]
pub enum Admission {
    Admitted(InFlightPermit),
    Rejected(SkipReason),
}

/// Admits at most one guarded delivery at a time
#[derive(Clone)]
pub struct SendGuard {
    state: Arc<SharedState>,
    slot: Arc<Semaphore>,
}

impl SendGuard {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self {
            state,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Decide whether `token` warrants a delivery
    ///
    /// The dedup check and slot acquisition happen without a suspension
    /// point in between.
    pub fn try_admit(&self, token: &str) -> Admission {
        if token.trim().is_empty() {
            return Admission::Rejected(SkipReason::EmptyToken);
        }

        if self.state.is_last_delivered(token) {
            return Admission::Rejected(SkipReason::Duplicate);
        }

        let permit = match Arc::clone(&self.slot).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Admission::Rejected(SkipReason::InFlight),
        };

        // A delivery of the same token may have completed since the first check
        if self.state.is_last_delivered(token) {
            return Admission::Rejected(SkipReason::Duplicate);
        }

        Admission::Admitted(InFlightPermit { _permit: permit })
    }

    /// Whether a guarded delivery currently holds the slot
    pub fn is_sending(&self) -> bool {
        self.slot.available_permits() == 0
    }
}
