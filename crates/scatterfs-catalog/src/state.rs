//! Transfer-job states and the legal transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a transfer job.
///
/// States only advance forward through the listed order, with two
/// exceptions: a reaped job whose remote exit was not clean moves to
/// [`Errored`](JobState::Errored), and any non-terminal job may be routed
/// to `Errored` on a permanent failure. No row ever moves backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    /// Scheduled; no remote job exists yet.
    New,
    /// Remote job created on the source node.
    Created,
    /// Remote job committed for execution.
    Committed,
    /// Remote job finished; exit metadata recorded.
    Waited,
    /// Remote job resources released.
    Reaped,
    /// Replica confirmed at its canonical path. Terminal.
    Completed,
    /// Permanent failure recorded. Terminal.
    Errored,
}

impl JobState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn may_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (New, Created)
            | (Created, Committed)
            | (Committed, Waited)
            | (Waited, Reaped)
            | (Reaped, Completed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Catalog spelling of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Created => "CREATED",
            JobState::Committed => "COMMITTED",
            JobState::Waited => "WAITED",
            JobState::Reaped => "REAPED",
            JobState::Completed => "COMPLETED",
            JobState::Errored => "ERRORED",
        }
    }

    /// All states, in forward order.
    pub fn all() -> [JobState; 7] {
        use JobState::*;
        [New, Created, Committed, Waited, Reaped, Completed, Errored]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::JobState::*;
    use super::*;

    #[test]
    fn forward_chain_is_legal() {
        assert!(New.may_advance_to(Created));
        assert!(Created.may_advance_to(Committed));
        assert!(Committed.may_advance_to(Waited));
        assert!(Waited.may_advance_to(Reaped));
        assert!(Reaped.may_advance_to(Completed));
    }

    #[test]
    fn errored_reachable_from_any_non_terminal() {
        for state in JobState::all() {
            assert_eq!(state.may_advance_to(Errored), !state.is_terminal());
        }
    }

    #[test]
    fn no_backward_or_skipping_moves() {
        assert!(!Created.may_advance_to(New));
        assert!(!New.may_advance_to(Committed));
        assert!(!Completed.may_advance_to(Errored));
        assert!(!Errored.may_advance_to(Completed));
        assert!(!Reaped.may_advance_to(Waited));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for next in JobState::all() {
            assert!(!Completed.may_advance_to(next));
            assert!(!Errored.may_advance_to(next));
        }
    }

    proptest::proptest! {
        // Every legal transition moves strictly forward in the declared
        // order, and never out of a terminal state.
        #[test]
        fn transitions_never_move_backward(a in 0usize..7, b in 0usize..7) {
            let from = JobState::all()[a];
            let to = JobState::all()[b];
            if from.may_advance_to(to) {
                proptest::prop_assert!(to > from);
                proptest::prop_assert!(!from.is_terminal());
            }
        }
    }
}
