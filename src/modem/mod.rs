//! Cellular modem control over AT commands
//!
//! - `exchange`: command/response primitive with keyword matching
//! - `lifecycle`: bring-up from power-on to an open TCP socket, and teardown
//! - `retry`: bounded retry policy for steps that may need several tries
//! - `commands`: command strings and response markers

pub mod commands;
mod error;
pub mod exchange;
pub mod lifecycle;
pub mod retry;

pub use error::ModemError;
pub use exchange::AtExchange;
pub use lifecycle::{ModemConfig, ModemSession, ModemTimings};
pub use retry::{RetryOutcome, RetryPolicy};
