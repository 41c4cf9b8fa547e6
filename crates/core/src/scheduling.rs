//! Service states, priority constants and the state machine.
//!
//! This module lives in `core` (zero internal deps) so the persistence layer,
//! the engine and any CLI tooling agree on one transition table.

use crate::define_text_enum;

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for urgent services. Claimed before all others.
pub const PRIORITY_URGENT: i32 = 10;

/// Priority value for normal services. Default.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background services. Claimed last.
pub const PRIORITY_BACKGROUND: i32 = -10;

/// Priority a child must have, given its requested priority and its parent's.
///
/// A child always outranks its parent so that the sub-work a running parent
/// waits on is claimed ahead of unrelated work at the parent's level.
pub fn child_priority(requested: i32, parent: i32) -> i32 {
    if requested <= parent {
        parent.saturating_add(1)
    } else {
        requested
    }
}

// ---------------------------------------------------------------------------
// ServiceState
// ---------------------------------------------------------------------------

define_text_enum! {
    /// Lifecycle state of a service record.
    ServiceState {
        Created => "CREATED",
        Queued => "QUEUED",
        Dispatched => "DISPATCHED",
        Running => "RUNNING",
        WaitingForDependencies => "WAITING_FOR_DEPENDENCIES",
        Suspended => "SUSPENDED",
        Resumed => "RESUMED",
        Canceled => "CANCELED",
        Timeout => "TIMEOUT",
        Error => "ERROR",
        Successful => "SUCCESSFUL",
    }
}

impl ServiceState {
    /// States from which no further transition occurs.
    pub const TERMINAL: &'static [ServiceState] = &[
        ServiceState::Canceled,
        ServiceState::Timeout,
        ServiceState::Error,
        ServiceState::Successful,
    ];

    /// Terminal states that count as a failure for dependents.
    pub const FAILED: &'static [ServiceState] = &[
        ServiceState::Canceled,
        ServiceState::Timeout,
        ServiceState::Error,
    ];

    /// States a dispatcher claims from.
    pub const CLAIMABLE: &'static [ServiceState] = &[ServiceState::Queued, ServiceState::Resumed];

    /// States in which a processor is (or is about to be) executing.
    pub const IN_FLIGHT: &'static [ServiceState] = &[
        ServiceState::Dispatched,
        ServiceState::Running,
        ServiceState::WaitingForDependencies,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn is_failure(self) -> bool {
        Self::FAILED.contains(&self)
    }

    pub fn is_successful(self) -> bool {
        self == ServiceState::Successful
    }

    /// Every state that is not terminal.
    pub fn non_terminal() -> Vec<ServiceState> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::ServiceState;
    use super::ServiceState::*;

    /// Returns the set of states reachable from `from`.
    ///
    /// Terminal states return an empty slice. `ERROR` is reachable from every
    /// non-terminal state because system failures (dependency failure,
    /// persistence failure) may strike at any point.
    pub fn valid_transitions(from: ServiceState) -> &'static [ServiceState] {
        match from {
            Created => &[Queued, Suspended, Canceled, Error],
            Queued => &[Dispatched, Suspended, Canceled, Error],
            Dispatched => &[
                Running,
                WaitingForDependencies,
                Suspended,
                Canceled,
                Timeout,
                Error,
            ],
            Running => &[
                WaitingForDependencies,
                Successful,
                Error,
                Timeout,
                Canceled,
                Suspended,
            ],
            WaitingForDependencies => &[Running, Successful, Error, Timeout, Canceled, Suspended],
            Suspended => &[Resumed, Canceled, Error],
            Resumed => &[Queued, Dispatched, Suspended, Canceled, Error],
            Canceled | Timeout | Error | Successful => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    ///
    /// Re-entering the current state is allowed for non-terminal states.
    pub fn can_transition(from: ServiceState, to: ServiceState) -> bool {
        (from == to && !from.is_terminal()) || valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid ones.
    pub fn validate_transition(from: ServiceState, to: ServiceState) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }

    /// States from which `to` can be reached, used as the CAS guard of a
    /// conditional update.
    pub fn sources_of(to: ServiceState) -> Vec<ServiceState> {
        ServiceState::ALL
            .iter()
            .copied()
            .filter(|from| can_transition(*from, to))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::state_machine::*;
    use super::*;

    // -----------------------------------------------------------------------
    // Valid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn created_to_queued() {
        assert!(can_transition(ServiceState::Created, ServiceState::Queued));
    }

    #[test]
    fn queued_to_dispatched() {
        assert!(can_transition(ServiceState::Queued, ServiceState::Dispatched));
    }

    #[test]
    fn dispatched_to_running() {
        assert!(can_transition(ServiceState::Dispatched, ServiceState::Running));
    }

    #[test]
    fn running_toggles_waiting_for_dependencies() {
        assert!(can_transition(
            ServiceState::Running,
            ServiceState::WaitingForDependencies
        ));
        assert!(can_transition(
            ServiceState::WaitingForDependencies,
            ServiceState::Running
        ));
    }

    #[test]
    fn waiting_reenters_itself() {
        assert!(can_transition(
            ServiceState::WaitingForDependencies,
            ServiceState::WaitingForDependencies
        ));
    }

    #[test]
    fn running_to_every_outcome() {
        for to in ServiceState::TERMINAL {
            assert!(can_transition(ServiceState::Running, *to), "running -> {to}");
        }
    }

    #[test]
    fn suspend_resume_requeue() {
        assert!(can_transition(ServiceState::Queued, ServiceState::Suspended));
        assert!(can_transition(ServiceState::Suspended, ServiceState::Resumed));
        assert!(can_transition(ServiceState::Resumed, ServiceState::Queued));
    }

    #[test]
    fn every_non_terminal_state_can_cancel_and_error() {
        for from in ServiceState::non_terminal() {
            assert!(can_transition(from, ServiceState::Canceled), "{from} -> CANCELED");
            assert!(can_transition(from, ServiceState::Error), "{from} -> ERROR");
        }
    }

    // -----------------------------------------------------------------------
    // Invalid transitions
    // -----------------------------------------------------------------------

    #[test]
    fn terminal_states_are_final() {
        for from in ServiceState::TERMINAL {
            assert!(valid_transitions(*from).is_empty());
            for to in ServiceState::ALL {
                assert!(!can_transition(*from, *to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn created_cannot_skip_to_running() {
        assert!(!can_transition(ServiceState::Created, ServiceState::Running));
    }

    #[test]
    fn queued_cannot_succeed_directly() {
        assert!(!can_transition(ServiceState::Queued, ServiceState::Successful));
    }

    #[test]
    fn suspended_cannot_resume_into_running() {
        assert!(!can_transition(ServiceState::Suspended, ServiceState::Running));
    }

    #[test]
    fn validate_transition_names_both_states() {
        let err = validate_transition(ServiceState::Successful, ServiceState::Queued).unwrap_err();
        assert_eq!(err, "Invalid transition: SUCCESSFUL -> QUEUED");
    }

    #[test]
    fn sources_of_timeout_are_in_flight_states() {
        let sources = sources_of(ServiceState::Timeout);
        assert_eq!(
            sources,
            vec![
                ServiceState::Dispatched,
                ServiceState::Running,
                ServiceState::WaitingForDependencies,
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Text mapping and priorities
    // -----------------------------------------------------------------------

    #[test]
    fn state_text_round_trips() {
        for state in ServiceState::ALL {
            assert_eq!(state.as_str().parse::<ServiceState>().unwrap(), *state);
        }
    }

    #[test]
    fn unknown_state_text_is_rejected() {
        assert!("ARCHIVED".parse::<ServiceState>().is_err());
    }

    #[test]
    fn state_serializes_as_screaming_text() {
        let json = serde_json::to_string(&ServiceState::WaitingForDependencies).unwrap();
        assert_eq!(json, "\"WAITING_FOR_DEPENDENCIES\"");
    }

    #[test]
    fn child_priority_outranks_parent() {
        assert_eq!(child_priority(0, 0), 1);
        assert_eq!(child_priority(-5, 3), 4);
        assert_eq!(child_priority(9, 3), 9);
    }
}
