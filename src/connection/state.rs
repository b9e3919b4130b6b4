//! Connection lifecycle state machine

use crate::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one connect or bind attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Waiting for the engine to establish the channel
    Pending,

    /// Channel established and supervised
    Active,

    /// Torn down (closed or released to a pool)
    Disposed,

    /// Attempt or live connection failed
    Failed,
}

impl LifecycleState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Pending, Active) | (Pending, Failed) | (Active, Disposed) | (Active, Failed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: LifecycleState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Disposed | LifecycleState::Failed)
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Pending => 0,
            LifecycleState::Active => 1,
            LifecycleState::Disposed => 2,
            LifecycleState::Failed => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Pending,
            1 => LifecycleState::Active,
            2 => LifecycleState::Disposed,
            _ => LifecycleState::Failed,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Disposed => write!(f, "disposed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State shared between the bridge task and connection handles
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: LifecycleState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut state = LifecycleState::Pending;
        assert!(state.transition(LifecycleState::Active).is_ok());
        assert!(state.transition(LifecycleState::Disposed).is_ok());
        assert!(state.is_terminal());
    }

    #[test]
    fn test_pending_can_fail() {
        let mut state = LifecycleState::Pending;
        assert!(state.transition(LifecycleState::Failed).is_ok());
    }

    #[test]
    fn test_active_can_fail() {
        let mut state = LifecycleState::Active;
        assert!(state.transition(LifecycleState::Failed).is_ok());
    }

    #[test]
    fn test_no_second_activation() {
        let mut state = LifecycleState::Active;
        let err = state.transition(LifecycleState::Active).unwrap_err();
        assert!(err.to_string().contains("active to active"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [LifecycleState::Disposed, LifecycleState::Failed] {
            let mut state = terminal;
            assert!(state.transition(LifecycleState::Active).is_err());
            assert!(state.transition(LifecycleState::Pending).is_err());
            assert_eq!(state, terminal);
        }
    }

    #[test]
    fn test_pending_cannot_skip_to_disposed() {
        let mut state = LifecycleState::Pending;
        assert!(state.transition(LifecycleState::Disposed).is_err());
    }

    #[test]
    fn test_atomic_state_round_trip() {
        let shared = AtomicState::new(LifecycleState::Pending);
        shared.store(LifecycleState::Failed);
        assert_eq!(shared.load(), LifecycleState::Failed);
    }
}
