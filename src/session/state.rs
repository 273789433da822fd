//! Exporter state machine
//!
//! Tracks one export session from creation to teardown.
//!
//! ```text
//! Created ─► Authorizing ─► Playing ⇄ Paused
//!    │            │           │  ▲
//!    │            │           ▼  │
//!    │            │         Seeking
//!    ▼            ▼           ▼
//!    └──────► Terminating ─► Closed
//! ```

use std::fmt;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Built, no request started yet
    #[default]
    Created,
    /// Waiting for the authorizer
    Authorizing,
    /// Attached and streaming
    Playing,
    /// Attached, paused by the consumer
    Paused,
    /// Seek forwarded, waiting for the element to confirm
    Seeking,
    /// Teardown in progress
    Terminating,
    /// Done; nothing else happens
    Closed,
}

impl SessionState {
    /// State name for logs
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Authorizing => "AUTHORIZING",
            SessionState::Playing => "PLAYING",
            SessionState::Paused => "PAUSED",
            SessionState::Seeking => "SEEKING",
            SessionState::Terminating => "TERMINATING",
            SessionState::Closed => "CLOSED",
        }
    }

    /// Attached to an element
    pub fn is_attached(self) -> bool {
        matches!(
            self,
            SessionState::Playing | SessionState::Paused | SessionState::Seeking
        )
    }

    /// Teardown started or done
    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Closed)
    }

    /// Whether `next` may follow this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Authorizing | Playing | Terminating) => true,
            (Authorizing, Playing | Terminating) => true,
            (Playing, Paused | Seeking | Terminating) => true,
            (Paused, Playing | Seeking | Terminating) => true,
            (Seeking, Playing | Paused | Terminating) => true,
            (Terminating, Closed) => true,
            _ => false,
        }
    }

    /// Move to `next` if allowed; returns whether the state changed
    pub fn advance(&mut self, next: SessionState) -> bool {
        if self.can_transition_to(next) {
            *self = next;
            true
        } else {
            tracing::trace!(from = %self, to = %next, "Ignoring state transition");
            false
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut state = SessionState::default();
        assert_eq!(state, SessionState::Created);

        assert!(state.advance(SessionState::Authorizing));
        assert!(state.advance(SessionState::Playing));
        assert!(state.is_attached());
        assert!(state.advance(SessionState::Paused));
        assert!(state.advance(SessionState::Seeking));
        assert!(state.advance(SessionState::Playing));
        assert!(state.advance(SessionState::Terminating));
        assert!(state.is_closing());
        assert!(state.advance(SessionState::Closed));
        assert!(!state.advance(SessionState::Playing));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_no_way_back() {
        let mut state = SessionState::Terminating;
        assert!(!state.advance(SessionState::Playing));
        assert!(!state.advance(SessionState::Authorizing));
        assert!(!SessionState::Authorizing.can_transition_to(SessionState::Paused));
        assert!(!SessionState::Created.can_transition_to(SessionState::Closed));
        assert_eq!(SessionState::Seeking.to_string(), "SEEKING");
    }
}
