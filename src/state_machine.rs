//! Assistant turn state:
//! Sleep → Listening → Recognizing → Thinking → Speaking → Listening/Sleep.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AssistantState {
    /// Waiting for the wake word.
    Sleep,
    /// Capturing the user's utterance.
    Listening,
    Recognizing,
    /// Waiting on the dialogue service.
    Thinking,
    Speaking,
}

impl std::fmt::Display for AssistantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssistantState::Sleep => write!(f, "Sleep"),
            AssistantState::Listening => write!(f, "Listening"),
            AssistantState::Recognizing => write!(f, "Recognizing"),
            AssistantState::Thinking => write!(f, "Thinking"),
            AssistantState::Speaking => write!(f, "Speaking"),
        }
    }
}

impl AssistantState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: AssistantState) -> bool {
        matches!(
            (self, next),
            (AssistantState::Sleep, AssistantState::Speaking) // wake greeting
                | (AssistantState::Sleep, AssistantState::Listening)
                | (AssistantState::Listening, AssistantState::Recognizing)
                | (AssistantState::Listening, AssistantState::Speaking) // nothing captured
                | (AssistantState::Recognizing, AssistantState::Thinking)
                | (AssistantState::Recognizing, AssistantState::Speaking) // not heard / endword
                | (AssistantState::Thinking, AssistantState::Speaking)
                | (AssistantState::Speaking, AssistantState::Listening) // next turn
                | (_, AssistantState::Sleep)
        )
    }
}

/// Thread-safe state holder.
pub struct StateMachine {
    state: RwLock<AssistantState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AssistantState::Sleep),
        }
    }

    pub fn current(&self) -> AssistantState {
        *self.state.read()
    }

    /// Attempt a state transition. Invalid transitions are logged and rejected.
    pub fn transition(&self, next: AssistantState) -> Result<AssistantState, String> {
        let mut state = self.state.write();
        let current = *state;
        if current == next {
            return Ok(next);
        }
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *state = next;
        info!(from = %current, to = %next, "state_transition");
        Ok(next)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_cycle_is_valid() {
        let sm = StateMachine::new();
        for next in [
            AssistantState::Speaking,
            AssistantState::Listening,
            AssistantState::Recognizing,
            AssistantState::Thinking,
            AssistantState::Speaking,
            AssistantState::Listening,
        ] {
            assert_eq!(sm.transition(next), Ok(next));
        }
        assert_eq!(sm.current(), AssistantState::Listening);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let sm = StateMachine::new();
        assert!(sm.transition(AssistantState::Thinking).is_err());
        assert_eq!(sm.current(), AssistantState::Sleep);
    }

    #[test]
    fn test_every_state_can_return_to_sleep() {
        let sm = StateMachine::new();
        for next in [
            AssistantState::Listening,
            AssistantState::Recognizing,
            AssistantState::Thinking,
            AssistantState::Speaking,
        ] {
            sm.transition(AssistantState::Sleep).unwrap();
            sm.transition(AssistantState::Listening).unwrap();
            if next != AssistantState::Listening {
                sm.transition(AssistantState::Recognizing).unwrap();
            }
            if next == AssistantState::Thinking || next == AssistantState::Speaking {
                sm.transition(AssistantState::Thinking).unwrap();
            }
            if next == AssistantState::Speaking {
                sm.transition(AssistantState::Speaking).unwrap();
            }
            assert_eq!(sm.current(), next);
            assert_eq!(sm.transition(AssistantState::Sleep), Ok(AssistantState::Sleep));
        }
    }
}
