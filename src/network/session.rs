//! Session lifecycle shared by publisher and subscriber sessions

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a media transport session
///
/// `Created → Instantiated → Running → Stopped`. Stopped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Instantiated,
    Running,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Instantiated => "instantiated",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State holder enforcing the allowed transitions
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Created),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state.lock()
    }

    /// First call on a session moves it out of `Created`
    pub fn touch(&self) -> SessionState {
        let mut state = self.state.lock();
        if *state == SessionState::Created {
            *state = SessionState::Instantiated;
        }
        *state
    }

    /// `Instantiated → Running`; false if the session moved on meanwhile
    pub fn set_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Instantiated {
            *state = SessionState::Running;
            true
        } else {
            false
        }
    }

    /// Move to `Stopped`, returning the previous state
    pub fn stop(&self) -> SessionState {
        let mut state = self.state.lock();
        std::mem::replace(&mut *state, SessionState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Created);
        assert_eq!(cell.touch(), SessionState::Instantiated);
        assert!(cell.set_running());
        assert!(!cell.set_running());
        assert_eq!(cell.stop(), SessionState::Running);
        assert_eq!(cell.touch(), SessionState::Stopped);
        assert_eq!(cell.stop(), SessionState::Stopped);
    }
}
