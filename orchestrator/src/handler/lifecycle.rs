//! Handler lifecycle state machine.

use crate::errors::StateError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    /// Constructed, not yet initialized.
    Created,
    /// `initialize` succeeded.
    Initialized,
    /// `execute` is in progress (across retries).
    Executing,
    /// `execute` produced outputs.
    Succeeded,
    /// Initialization or execution failed, or execution was cancelled.
    Failed,
    /// `cleanup` has run.
    Cleaned,
}

impl HandlerState {
    /// Returns true once `cleanup` has run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cleaned)
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Executing => "executing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cleaned => "cleaned",
        };
        write!(f, "{s}")
    }
}

/// Guards handler transitions.
///
/// `Created → Initialized → Executing → {Succeeded | Failed} → Cleaned`, plus
/// `Created → Failed` for a failed initialize and `Initialized → Failed` for
/// a run cancelled before execution. Only handlers that reached
/// `Initialized` may be cleaned.
#[derive(Debug, Clone)]
pub struct HandlerLifecycle {
    state: HandlerState,
    initialized: bool,
}

impl Default for HandlerLifecycle {
    fn default() -> Self {
        Self {
            state: HandlerState::Created,
            initialized: false,
        }
    }
}

impl HandlerLifecycle {
    /// Starts in `Created`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Returns true if the handler ever reached `Initialized`.
    #[must_use]
    pub fn reached_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true if cleanup is still owed.
    #[must_use]
    pub fn needs_cleanup(&self) -> bool {
        self.initialized && self.state != HandlerState::Cleaned
    }

    /// Moves to `next` or fails with a [`StateError`].
    pub fn transition(&mut self, next: HandlerState) -> Result<(), StateError> {
        use HandlerState::{Cleaned, Created, Executing, Failed, Initialized, Succeeded};

        let allowed = match (self.state, next) {
            (Created, Initialized | Failed)
            | (Initialized, Executing | Failed)
            | (Executing, Succeeded | Failed) => true,
            (Succeeded | Failed, Cleaned) => self.initialized,
            _ => false,
        };

        if !allowed {
            return Err(StateError::new(format!(
                "illegal handler transition {} -> {next}",
                self.state
            )));
        }

        if next == Initialized {
            self.initialized = true;
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = HandlerLifecycle::new();
        for next in [
            HandlerState::Initialized,
            HandlerState::Executing,
            HandlerState::Succeeded,
            HandlerState::Cleaned,
        ] {
            lifecycle.transition(next).unwrap();
        }
        assert!(lifecycle.state().is_terminal());
        assert!(!lifecycle.needs_cleanup());
    }

    #[test]
    fn test_failed_execute_still_cleans() {
        let mut lifecycle = HandlerLifecycle::new();
        lifecycle.transition(HandlerState::Initialized).unwrap();
        lifecycle.transition(HandlerState::Executing).unwrap();
        lifecycle.transition(HandlerState::Failed).unwrap();
        assert!(lifecycle.needs_cleanup());
        lifecycle.transition(HandlerState::Cleaned).unwrap();
    }

    #[test]
    fn test_failed_initialize_cannot_clean() {
        let mut lifecycle = HandlerLifecycle::new();
        lifecycle.transition(HandlerState::Failed).unwrap();
        assert!(!lifecycle.needs_cleanup());
        assert!(lifecycle.transition(HandlerState::Cleaned).is_err());
    }

    #[test]
    fn test_cleanup_only_once() {
        let mut lifecycle = HandlerLifecycle::new();
        lifecycle.transition(HandlerState::Initialized).unwrap();
        lifecycle.transition(HandlerState::Failed).unwrap();
        lifecycle.transition(HandlerState::Cleaned).unwrap();
        assert!(lifecycle.transition(HandlerState::Cleaned).is_err());
    }

    #[test]
    fn test_no_backwards_transitions() {
        let mut lifecycle = HandlerLifecycle::new();
        lifecycle.transition(HandlerState::Initialized).unwrap();
        lifecycle.transition(HandlerState::Executing).unwrap();
        lifecycle.transition(HandlerState::Succeeded).unwrap();
        assert!(lifecycle.transition(HandlerState::Executing).is_err());
        assert!(lifecycle.transition(HandlerState::Initialized).is_err());
    }
}
