// Change detection
// Host notifications and periodic polling, normalized into candidates

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::source::CredentialSource;
use super::types::{mask, non_empty, Candidate, CandidateOrigin, CredentialEvent, CredentialTarget};
use crate::error::RelayError;
use crate::state::SharedState;

/// Failures logged at error level once every this many consecutive polls
const POLL_FAILURE_ESCALATION: u32 = 10;

/// Producer half of the candidate queue
#[derive(Clone)]
pub struct CandidateSender {
    tx: mpsc::Sender<Candidate>,
}

impl CandidateSender {
    /// Create a bounded candidate queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Candidate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a candidate without waiting
    ///
    /// Returns `false` when the queue is full or the consumer is gone.
    pub fn emit(&self, token: &str, origin: CandidateOrigin) -> bool {
        let candidate = Candidate {
            token: token.to_string(),
            origin,
        };
        match self.tx.try_send(candidate) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Candidate queue full, dropping {} candidate", origin);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Candidate queue closed, dropping {} candidate", origin);
                false
            }
        }
    }
}

/// Result of a single poll
#[derive(Debug)]
pub enum PollResult {
    /// A new value was cached and queued
    Changed,
    /// The source matches the cache
    Unchanged,
    /// The source could not be read; nothing was touched
    Failed(RelayError),
}

/// Turns host notifications and timer ticks into candidates
#[derive(Clone)]
pub struct ChangeDetector {
    state: Arc<SharedState>,
    source: Arc<dyn CredentialSource>,
    target: CredentialTarget,
    candidates: CandidateSender,
}

impl ChangeDetector {
    pub fn new(
        state: Arc<SharedState>,
        source: Arc<dyn CredentialSource>,
        target: CredentialTarget,
        candidates: CandidateSender,
    ) -> Self {
        Self {
            state,
            source,
            target,
            candidates,
        }
    }

    pub fn target(&self) -> &CredentialTarget {
        &self.target
    }

    /// Whether a notification concerns the watched credential
    pub fn accepts(&self, event: &CredentialEvent) -> bool {
        event.name == self.target.name && self.target.matches_domain(&event.domain)
    }

    /// Handle a host change notification
    ///
    /// Returns `true` when the event produced a candidate.
    pub fn handle_event(&self, event: &CredentialEvent) -> bool {
        if !self.accepts(event) {
            tracing::trace!(
                "Ignoring credential event for {} on {}",
                event.name,
                event.domain
            );
            return false;
        }

        if event.removed {
            tracing::debug!("Watched credential removed on {}", event.domain);
            return false;
        }

        let Some(token) = non_empty(event.value.clone()) else {
            return false;
        };

        tracing::info!(
            "Credential change notified on {}: {}",
            event.domain,
            mask(&token)
        );
        self.state.cache().set(&token, true);
        self.candidates.emit(&token, CandidateOrigin::HostEvent)
    }

    /// Re-query the source and queue a candidate if the value moved
    pub async fn poll_once(&self) -> PollResult {
        let token = match self.source.current().await {
            Ok(token) => token,
            Err(e) => return PollResult::Failed(e),
        };

        let Some(token) = non_empty(Some(token)) else {
            return PollResult::Failed(RelayError::Acquisition(
                "source returned an empty value".to_string(),
            ));
        };

        if self.state.cache().peek().as_deref() == Some(token.as_str()) {
            return PollResult::Unchanged;
        }

        tracing::info!("Poll observed new credential value: {}", mask(&token));
        self.state.cache().set(&token, true);
        self.candidates.emit(&token, CandidateOrigin::Poll);
        PollResult::Changed
    }

    /// Poll forever on a fixed schedule
    ///
    /// The first poll happens one period after start. Each tick awaits its
    /// poll, so polls never overlap; late ticks are delayed, not bursted.
    pub async fn run_polling(self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        tracing::info!("Polling credential source every {}s", period.as_secs());

        loop {
            ticker.tick().await;

            match self.poll_once().await {
                PollResult::Failed(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures % POLL_FAILURE_ESCALATION == 0 {
                        tracing::error!(
                            "Credential poll failed {} times in a row: {}",
                            consecutive_failures,
                            e
                        );
                    } else {
                        tracing::warn!(
                            "Credential poll failed (attempt {}): {}",
                            consecutive_failures,
                            e
                        );
                    }
                }
                PollResult::Changed | PollResult::Unchanged => {
                    if consecutive_failures > 0 {
                        tracing::info!(
                            "Credential poll recovered after {} failures",
                            consecutive_failures
                        );
                    }
                    consecutive_failures = 0;
                }
            }
        }
    }
}
