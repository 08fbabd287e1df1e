//! Session lifecycle state machine

use parking_lot::Mutex;
use std::fmt;

use crate::error::SessionError;

/// Main session state; mute flags are orthogonal to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Active => "Active",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
        }
    }

    /// States from which `self` may be entered
    fn predecessors(&self) -> &'static [SessionState] {
        match self {
            SessionState::Idle => &[],
            SessionState::Connecting => &[SessionState::Idle],
            SessionState::Active => &[SessionState::Connecting],
            SessionState::Closing => &[SessionState::Active],
            // Failed starts and never-started sessions close directly
            SessionState::Closed => &[
                SessionState::Idle,
                SessionState::Connecting,
                SessionState::Closing,
            ],
        }
    }

    fn expected_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "none",
            SessionState::Connecting => "Idle",
            SessionState::Active => "Connecting",
            SessionState::Closing => "Active",
            SessionState::Closed => "Idle, Connecting or Closing",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        *self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state cell with validated transitions
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: SessionState) -> Result<SessionState, SessionError> {
        let mut state = self.state.lock();
        let previous = *state;
        if !previous.can_transition_to(next) {
            return Err(SessionError::InvalidState {
                expected: next.expected_str(),
                actual: previous.as_str(),
            });
        }
        *state = next;
        tracing::info!("Session {} -> {}", previous, next);
        Ok(previous)
    }

    /// Fail unless the session is in `expected`
    pub fn require(&self, expected: SessionState) -> Result<(), SessionError> {
        let actual = self.get();
        if actual == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected: expected.as_str(),
                actual: actual.as_str(),
            })
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
