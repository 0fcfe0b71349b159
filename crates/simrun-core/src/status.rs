//! Status enums for managed runs and services.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Lifecycle of a run managed by the coordinator.
///
/// `Requested -> Booking -> Initialized -> Running -> {Completed | Failed} -> CleanedUp`.
/// A run may also fail straight out of `Booking` or `Initialized` (no free host,
/// remote setup failure) and every state may be cleaned up after a breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Configuration received, nothing booked yet.
    #[default]
    Requested,
    /// Searching for and booking hosts.
    Booking,
    /// Primary host initialized the run.
    Initialized,
    /// Run started on its primary host.
    Running,
    /// Run finished successfully.
    Completed,
    /// Run failed.
    Failed,
    /// Resources released and bookkeeping dropped.
    CleanedUp,
}

impl RunState {
    /// Returns true if the run has produced an outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::CleanedUp)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Requested, Booking) => true,
            (Booking, Initialized) | (Booking, Failed) => true,
            (Initialized, Running) | (Initialized, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: RunState) -> Result<(), CoreError> {
        if !self.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// All states, in lifecycle order.
    pub fn all() -> &'static [RunState] {
        &[
            RunState::Requested,
            RunState::Booking,
            RunState::Initialized,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
            RunState::CleanedUp,
        ]
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Requested => "requested",
            RunState::Booking => "booking",
            RunState::Initialized => "initialized",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

/// Classification of a recorded run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Initialization could not produce a runnable computation.
    SetupFailure,
    /// Booking exhausted its retry budget.
    NoResourceAvailable,
    /// Transport error while talking to a host or the coordinator.
    RemoteDispatchFailure,
    /// The host running the computation was lost.
    HostBreakdown,
    /// The computation itself reported an error.
    ExecutionFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::SetupFailure => "setup failure",
            FailureKind::NoResourceAvailable => "no resource available",
            FailureKind::RemoteDispatchFailure => "remote dispatch failure",
            FailureKind::HostBreakdown => "host breakdown",
            FailureKind::ExecutionFailure => "execution failure",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = RunState::Requested;
        for next in [
            RunState::Booking,
            RunState::Initialized,
            RunState::Running,
            RunState::Completed,
            RunState::CleanedUp,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state, RunState::CleanedUp);
    }

    #[test]
    fn test_cannot_skip_booking() {
        let mut state = RunState::Requested;
        let err = state.transition(RunState::Running).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(state, RunState::Requested);
    }

    #[test]
    fn test_cleaned_up_is_final() {
        let mut state = RunState::CleanedUp;
        assert!(state.transition(RunState::Booking).is_err());
        assert!(state.transition(RunState::CleanedUp).is_err());
    }

    #[test]
    fn test_booking_may_fail() {
        assert!(RunState::Booking.can_transition_to(RunState::Failed));
        assert!(!RunState::Booking.can_transition_to(RunState::Completed));
    }
}
