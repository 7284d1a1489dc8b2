//! The session state machine (§4.3).
//!
//! ```text
//!    pending ──► planning ──► awaiting_approval ──► executing ──► completed
//!                 │                   │                │
//!                 └──► failed  ◄──────┴────────────────┴──► cancelled
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Planning,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Planning => "planning",
            SessionStatus::AwaitingApproval => "awaiting_approval",
            SessionStatus::Executing => "executing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => SessionStatus::Pending,
            "planning" => SessionStatus::Planning,
            "awaiting_approval" => SessionStatus::AwaitingApproval,
            "executing" => SessionStatus::Executing,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "cancelled" => SessionStatus::Cancelled,
            _ => return None,
        })
    }

    /// Terminal states are sinks — no outbound edges.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Used by `list({state:"running"})` — see DESIGN.md open-question decision.
    pub fn is_running(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns `true` if `self -> to` is a permitted edge of the state machine.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Pending, Planning) => true,
            (Planning, AwaitingApproval) => true,
            (Planning, Executing) => true,
            (AwaitingApproval, Executing) => true,
            (AwaitingApproval, Cancelled) => true,
            (Executing, Completed) => true,
            // Any non-terminal -> Failed or Cancelled is always permitted.
            (_, Failed) => true,
            (_, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn happy_path_is_reachable() {
        assert!(Pending.can_transition_to(Planning));
        assert!(Planning.can_transition_to(AwaitingApproval));
        assert!(AwaitingApproval.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
    }

    #[test]
    fn skip_approval_path() {
        assert!(Planning.can_transition_to(Executing));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Pending, Planning, AwaitingApproval, Executing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn illegal_edges_refused() {
        assert!(!Pending.can_transition_to(Executing));
        assert!(!Pending.can_transition_to(AwaitingApproval));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Executing.can_transition_to(AwaitingApproval));
    }

    #[test]
    fn any_nonterminal_can_fail_or_cancel() {
        for s in [Pending, Planning, AwaitingApproval, Executing] {
            assert!(s.can_transition_to(Failed));
            assert!(s.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn round_trip_through_str() {
        for s in [Pending, Planning, AwaitingApproval, Executing, Completed, Failed, Cancelled] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }
}
