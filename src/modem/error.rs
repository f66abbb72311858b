use cellbridge_shared::{ModemEvent, ModemState};
use thiserror::Error;

/// Failures that end modem bring-up
#[derive(Error, Debug)]
pub enum ModemError {
    #[error("SIM not ready (response: {response:?})")]
    SimNotReady { response: String },

    #[error("Network attach failed after {attempts} attempts")]
    AttachExhausted { attempts: u32 },

    #[error("Failed to open network bearer (response: {response:?})")]
    BearerOpenFailed { response: String },

    #[error("Failed to open TCP socket {socket_id} (response: {response:?})")]
    SocketOpenFailed { socket_id: u8, response: String },

    #[error("Invalid modem transition from {from} on {event:?}")]
    InvalidTransition { from: ModemState, event: ModemEvent },

    #[error("Modem link I/O error: {0}")]
    Io(#[from] std::io::Error),
}
