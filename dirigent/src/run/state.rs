//! Run lifecycle states and the directed transition graph.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one pipeline run.
///
/// Transitions are one-directional except for the retry edges back into
/// `DesignProcessing`; [`RunState::can_transition_to`] is the single source
/// of truth for the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initial,
    RequirementsProcessing,
    RequirementsWaitingApproval,
    RequirementsApproved,
    RequirementsRejected,
    DesignProcessing,
    DesignWaitingApproval,
    DesignApproved,
    DesignRejected,
    ValidationProcessing,
    ValidationPassed,
    ValidationFailed,
    ExecutionProcessing,
    ExecutionCompleted,
    ExecutionFailed,
    Cancelled,
}

impl RunState {
    /// States with no outgoing edges. A terminal run ignores further reports.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::RequirementsRejected
                | RunState::DesignRejected
                | RunState::ExecutionCompleted
                | RunState::ExecutionFailed
                | RunState::Cancelled
        )
    }

    /// Whether the graph allows `self -> next`.
    ///
    /// Any non-terminal state may move to `Cancelled`; everything else is
    /// the explicit pipeline graph.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState as S;

        if next == S::Cancelled {
            return !self.is_terminal();
        }
        match self {
            S::Initial => matches!(next, S::RequirementsProcessing),
            S::RequirementsProcessing => {
                matches!(next, S::RequirementsWaitingApproval | S::RequirementsRejected)
            }
            S::RequirementsWaitingApproval => {
                matches!(next, S::RequirementsApproved | S::RequirementsRejected)
            }
            S::RequirementsApproved => matches!(next, S::DesignProcessing),
            S::DesignProcessing => matches!(
                next,
                S::DesignWaitingApproval | S::DesignRejected | S::DesignProcessing
            ),
            S::DesignWaitingApproval => matches!(next, S::DesignApproved | S::DesignRejected),
            S::DesignApproved => matches!(next, S::ValidationProcessing),
            S::ValidationProcessing => matches!(next, S::ValidationPassed | S::ValidationFailed),
            S::ValidationFailed => matches!(next, S::DesignProcessing | S::DesignRejected),
            S::ValidationPassed => matches!(next, S::ExecutionProcessing),
            S::ExecutionProcessing => matches!(next, S::ExecutionCompleted | S::ExecutionFailed),
            S::RequirementsRejected
            | S::DesignRejected
            | S::ExecutionCompleted
            | S::ExecutionFailed
            | S::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_walkable() {
        let path = [
            RunState::Initial,
            RunState::RequirementsProcessing,
            RunState::RequirementsWaitingApproval,
            RunState::RequirementsApproved,
            RunState::DesignProcessing,
            RunState::DesignWaitingApproval,
            RunState::DesignApproved,
            RunState::ValidationProcessing,
            RunState::ValidationPassed,
            RunState::ExecutionProcessing,
            RunState::ExecutionCompleted,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn approval_gates_cannot_be_skipped() {
        // Processing states may not jump straight to the approved state.
        assert!(!RunState::RequirementsProcessing.can_transition_to(RunState::RequirementsApproved));
        assert!(!RunState::DesignProcessing.can_transition_to(RunState::DesignApproved));
        assert!(!RunState::RequirementsApproved.can_transition_to(RunState::DesignWaitingApproval));
    }

    #[test]
    fn retry_edges_loop_back_into_design() {
        assert!(RunState::DesignProcessing.can_transition_to(RunState::DesignProcessing));
        assert!(RunState::ValidationFailed.can_transition_to(RunState::DesignProcessing));
        assert!(RunState::ValidationFailed.can_transition_to(RunState::DesignRejected));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let all = [
            RunState::Initial,
            RunState::RequirementsProcessing,
            RunState::RequirementsWaitingApproval,
            RunState::RequirementsApproved,
            RunState::RequirementsRejected,
            RunState::DesignProcessing,
            RunState::DesignWaitingApproval,
            RunState::DesignApproved,
            RunState::DesignRejected,
            RunState::ValidationProcessing,
            RunState::ValidationPassed,
            RunState::ValidationFailed,
            RunState::ExecutionProcessing,
            RunState::ExecutionCompleted,
            RunState::ExecutionFailed,
            RunState::Cancelled,
        ];
        for from in all {
            if !from.is_terminal() {
                continue;
            }
            for to in all {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn cancel_is_reachable_from_any_live_state() {
        assert!(RunState::Initial.can_transition_to(RunState::Cancelled));
        assert!(RunState::DesignWaitingApproval.can_transition_to(RunState::Cancelled));
        assert!(RunState::ValidationPassed.can_transition_to(RunState::Cancelled));
        assert!(!RunState::Cancelled.can_transition_to(RunState::Cancelled));
    }
}
