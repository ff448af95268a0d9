//! Instrument Link State Machine
//!
//! Defines valid transitions of one instrument connection:
//! `Disconnected -> Connected -> Busy -> Connected -> ... -> Disconnected`.
//! A link in `Busy` owns the single in-flight command; a second command is
//! refused until the first resolves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of one instrument link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connected,
    Busy,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Busy => write!(f, "Busy"),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Transport opened
    Opened,
    /// A command was handed to the transport
    CommandStarted,
    /// The in-flight command resolved (response, ack or error)
    CommandFinished,
    /// Transport failed and was dropped
    Failed,
    /// Transport closed on purpose
    Closed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(LinkState),
    /// Transition was invalid from current state
    Invalid { from: LinkState, event: LinkEvent },
}

/// The state machine for one instrument link
#[derive(Debug)]
pub struct LinkStateMachine {
    current_state: LinkState,
    commands_completed: u64,
    failures: u64,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self {
            current_state: LinkState::Disconnected,
            commands_completed: 0,
            failures: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> LinkState {
        self.current_state
    }

    pub fn is_connected(&self) -> bool {
        self.current_state != LinkState::Disconnected
    }

    /// Number of commands that went through Busy back to Connected
    pub fn commands_completed(&self) -> u64 {
        self.commands_completed
    }

    /// Number of transport failures seen on this link
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        // A failure always drops the link, whatever it was doing
        if event == LinkEvent::Failed {
            self.failures += 1;
            self.current_state = LinkState::Disconnected;
            return TransitionResult::Success(LinkState::Disconnected);
        }

        match self.get_next_state(&event) {
            Some(state) => {
                if self.current_state == LinkState::Busy && state == LinkState::Connected {
                    self.commands_completed += 1;
                }
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: &LinkEvent) -> Option<LinkState> {
        use LinkEvent::*;
        use LinkState::*;

        match (self.current_state, event) {
            (Disconnected, Opened) => Some(Connected),
            (Disconnected, Closed) => Some(Disconnected),

            (Connected, CommandStarted) => Some(Busy),
            (Connected, Closed) => Some(Disconnected),

            (Busy, CommandFinished) => Some(Connected),

            // Busy cannot start a second command or close mid-flight
            _ => None,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: LinkState, to: LinkState) -> bool {
    use LinkState::*;

    match (from, to) {
        (a, b) if a == b => true,
        (_, Disconnected) => true,
        (Disconnected, Connected) => true,
        (Connected, Busy) => true,
        (Busy, Connected) => true,
        _ => false,
    }
}
