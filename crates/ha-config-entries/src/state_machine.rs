//! Config entry lifecycle transitions
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress
//!                            ↘ SetupRetry → SetupInProgress (scheduled)
//!                            ↘ MigrationError (terminal)
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ FailedUnload (terminal)
//! ```

use std::time::Duration;

use crate::entry::ConfigEntryState;
use thiserror::Error;

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// Attempt a transition to a new state
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded | SetupError | SetupRetry | MigrationError)
                | (SetupError | SetupRetry, SetupInProgress | UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded | FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
        use ConfigEntryState::*;

        match (from, to) {
            (MigrationError, _) | (FailedUnload, _) => "terminal state, entry cannot recover",
            (SetupInProgress, _) => "setup must complete first",
            (UnloadInProgress, _) => "unload must complete first",
            (NotLoaded, _) => "setup has not started",
            (Loaded, SetupInProgress) => "already loaded, unload before setting up again",
            (Loaded, _) => "loaded entries must unload first",
            _ => "invalid state transition",
        }
    }
}

/// Delay before the next automatic setup attempt
///
/// `5s * 2^min(tries, 4)` plus up to 100ms of jitter: 5, 10, 20, 40, then 80s.
pub fn calculate_retry_delay(tries: u32) -> Duration {
    let base_secs = 5 * 2_u64.pow(tries.min(4));
    let jitter_ms = rand::random::<u64>() % 100;
    Duration::from_secs(base_secs) + Duration::from_millis(jitter_ms)
}
