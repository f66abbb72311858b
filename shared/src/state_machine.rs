//! Modem Session State Machine
//!
//! Tracks a cellular modem from power-on to an open TCP socket. The machine
//! only moves forward; the single exception is a failed network-attach attempt,
//! which keeps the session in `SimReady` while the caller retries.

use std::fmt;

/// Where the modem session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModemState {
    /// Nothing sent yet
    Uninitialized,
    /// Command echo switched off
    EchoDisabled,
    /// SIM reported ready
    SimReady,
    /// Packet service attached
    NetworkAttached,
    /// APN written to the PDP context
    BearerConfigured,
    /// Bearer open, socket not yet confirmed
    BearerOpen,
    /// TCP socket confirmed open
    SocketOpen,
    /// Socket and bearer torn down
    SocketClosed,
    /// A fatal step failed
    Failed,
}

impl fmt::Display for ModemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModemState::Uninitialized => "uninitialized",
            ModemState::EchoDisabled => "echo-disabled",
            ModemState::SimReady => "sim-ready",
            ModemState::NetworkAttached => "network-attached",
            ModemState::BearerConfigured => "bearer-configured",
            ModemState::BearerOpen => "bearer-open",
            ModemState::SocketOpen => "socket-open",
            ModemState::SocketClosed => "socket-closed",
            ModemState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observations that drive the session forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    /// Echo-disable command issued
    EchoDisabled,
    /// SIM status query returned the ready marker
    SimReady,
    /// SIM status query did not return the ready marker
    SimNotReady,
    /// One attach query came back without the attached marker
    AttachAttemptFailed,
    /// Attach query returned the attached marker
    Attached,
    /// All attach attempts used up
    AttachExhausted { attempts: u32 },
    /// APN configuration command issued
    BearerConfigured,
    /// Bearer-open returned its success marker
    BearerOpened,
    /// Bearer-open did not return its success marker
    BearerOpenFailed,
    /// Socket-open success marker seen for our socket
    SocketOpened { socket_id: u8 },
    /// Socket-open marker missing after both read windows
    SocketOpenFailed { socket_id: u8 },
    /// Teardown issued
    SocketClosed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid, new state attached
    Success(ModemState),
    /// Event does not apply to the current state; state unchanged
    Invalid { from: ModemState, event: ModemEvent },
    /// Event is a fatal failure; state is now `Failed`
    Fatal { reason: String },
}

/// The modem session state machine
#[derive(Debug)]
pub struct ModemStateMachine {
    current_state: ModemState,
    attach_attempts: u32,
}

impl Default for ModemStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ModemStateMachine {
    /// Create a new state machine in `Uninitialized`
    pub fn new() -> Self {
        Self {
            current_state: ModemState::Uninitialized,
            attach_attempts: 0,
        }
    }

    pub fn state(&self) -> ModemState {
        self.current_state
    }

    /// Attach attempts observed so far, successful one included
    pub fn attach_attempts(&self) -> u32 {
        self.attach_attempts
    }

    /// True once the TCP socket is usable for sends
    pub fn is_ready(&self) -> bool {
        self.current_state == ModemState::SocketOpen
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: ModemEvent) -> TransitionResult {
        use ModemEvent as E;
        use ModemState as S;

        // Teardown is accepted from anywhere, but never hides a failure
        if event == E::SocketClosed {
            if self.current_state != S::Failed {
                self.current_state = S::SocketClosed;
            }
            return TransitionResult::Success(self.current_state);
        }

        if let Some(reason) = self.fatal_reason(&event) {
            self.current_state = S::Failed;
            return TransitionResult::Fatal { reason };
        }

        match self.next_state(&event) {
            Some(state) => {
                if matches!(event, E::AttachAttemptFailed | E::Attached) {
                    self.attach_attempts += 1;
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

    /// Reason text if `event` is a fatal failure valid from the current state
    fn fatal_reason(&self, event: &ModemEvent) -> Option<String> {
        use ModemEvent as E;
        use ModemState as S;

        match (self.current_state, event) {
            (S::EchoDisabled, E::SimNotReady) => Some("SIM not ready".to_string()),
            (S::SimReady, E::AttachExhausted { attempts }) => Some(format!(
                "network attach failed after {} attempts",
                attempts
            )),
            (S::BearerConfigured, E::BearerOpenFailed) => {
                Some("failed to open network bearer".to_string())
            }
            (S::BearerOpen, E::SocketOpenFailed { socket_id }) => {
                Some(format!("failed to open TCP socket {}", socket_id))
            }
            _ => None,
        }
    }

    /// Get the next state for a non-fatal event, if the transition is valid
    fn next_state(&self, event: &ModemEvent) -> Option<ModemState> {
        use ModemEvent as E;
        use ModemState as S;

        match (self.current_state, event) {
            (S::Uninitialized, E::EchoDisabled) => Some(S::EchoDisabled),
            (S::EchoDisabled, E::SimReady) => Some(S::SimReady),

            // Retries keep the session parked at SimReady
            (S::SimReady, E::AttachAttemptFailed) => Some(S::SimReady),
            (S::SimReady, E::Attached) => Some(S::NetworkAttached),

            (S::NetworkAttached, E::BearerConfigured) => Some(S::BearerConfigured),
            (S::BearerConfigured, E::BearerOpened) => Some(S::BearerOpen),
            (S::BearerOpen, E::SocketOpened { .. }) => Some(S::SocketOpen),

            _ => None,
        }
    }
}
