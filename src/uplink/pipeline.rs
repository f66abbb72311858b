//! Length-prefixed send handshake
//!
//! ```text
//! host:  AT+CIPSEND=<id>,<len>\r\n
//! modem: >
//! host:  <len raw bytes>
//! modem: OK / +CIPSEND: <id>,<len>,<len> / server reply ...
//! ```
//!
//! The announced length and the bytes written come from the same payload, so
//! the modem never waits for bytes that will not arrive.

use crate::modem::commands;
use crate::modem::AtExchange;
use crate::transport::SerialLink;
use cellbridge_shared::{timing, TelemetryPayload};
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeouts for one transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimings {
    /// How long to wait for the send prompt
    pub prompt_timeout: Duration,
    /// Dwell after the payload before reading the modem's reply
    pub post_send_settle: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            prompt_timeout: Duration::from_millis(timing::SEND_PROMPT_TIMEOUT_MS),
            post_send_settle: Duration::from_millis(timing::POST_SEND_SETTLE_MS),
        }
    }
}

/// What happened to one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionOutcome {
    /// Payload written; `response` is whatever the modem printed afterwards
    Sent { announced: usize, response: String },
    /// No prompt, nothing written
    Skipped { announced: usize },
}

/// Drives the modem's send handshake for one socket
#[derive(Debug, Clone)]
pub struct TransmissionPipeline {
    socket_id: u8,
    timings: PipelineTimings,
}

impl TransmissionPipeline {
    pub fn new(socket_id: u8, timings: PipelineTimings) -> Self {
        Self { socket_id, timings }
    }

    pub fn socket_id(&self) -> u8 {
        self.socket_id
    }

    /// Send `payload` over the open socket.
    ///
    /// A missing prompt is not an error: the transmission is skipped and the
    /// caller moves on. Only link I/O failures are returned as errors.
    pub async fn transmit<L: SerialLink>(
        &self,
        exchange: &mut AtExchange<L>,
        payload: &TelemetryPayload,
    ) -> io::Result<TransmissionOutcome> {
        let announced = payload.len();
        if payload.is_empty() {
            return Ok(TransmissionOutcome::Skipped { announced });
        }

        exchange.clear_input()?;
        exchange
            .write_command(&commands::send_announce(self.socket_id, announced))
            .await?;

        if !exchange
            .await_keyword(commands::SEND_PROMPT, self.timings.prompt_timeout)
            .await?
        {
            warn!("[Uplink] No send prompt from modem; skipping {} bytes", announced);
            return Ok(TransmissionOutcome::Skipped { announced });
        }

        exchange.write_raw(payload.as_bytes()).await?;
        debug!("[Uplink] Wrote {} bytes on socket {}", announced, self.socket_id);

        // Advisory only; the modem's reply is not parsed for success
        let response = exchange.collect(self.timings.post_send_settle).await?;
        Ok(TransmissionOutcome::Sent {
            announced,
            response,
        })
    }
}
