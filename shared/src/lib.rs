//! Cellbridge Shared Types
//!
//! This crate holds the I/O-free half of the bridge: the modem session state
//! machine, the sensor frame assembler and the telemetry codec that turns a
//! completed frame into an HTTP request for the modem's TCP socket.

pub mod codec;
pub mod frame;
pub mod state_machine;

pub use codec::{
    normalize_sensor_type, AliasTable, CodecError, EncodeOutcome, HttpMethod, RejectedValue,
    SensorReading, TelemetryEncoder, TelemetryPayload,
};
pub use frame::{
    normalize_key, FrameAssembler, FrameOutcome, FramePolicy, IgnoredPair, LineReport,
    SensorFrame,
};
pub use state_machine::{ModemEvent, ModemState, ModemStateMachine, TransitionResult};

/// Default timings for the modem session, in milliseconds
///
/// Radio-dependent steps (bearer open, socket open) are several seconds long;
/// local AT commands settle within a second.
pub mod timing {
    /// Serial inactivity read timeout for both links
    pub const READ_TIMEOUT_MS: u64 = 1000;

    /// Slice used while polling for a keyword
    pub const KEYWORD_POLL_MS: u64 = 100;

    /// Dwell after local AT commands (AT, ATE0, CPIN, CGATT, IPADDR)
    pub const LOCAL_SETTLE_MS: u64 = 1000;

    /// Dwell after the APN configuration command
    pub const APN_SETTLE_MS: u64 = 1000;

    /// Dwell after closing the bearer
    pub const BEARER_CLOSE_SETTLE_MS: u64 = 1000;

    /// Dwell after opening the bearer
    pub const BEARER_OPEN_SETTLE_MS: u64 = 5000;

    /// Network attach attempts before giving up
    pub const ATTACH_MAX_ATTEMPTS: u32 = 3;

    /// Pause between network attach attempts
    pub const ATTACH_BACKOFF_MS: u64 = 3000;

    /// First read window after the socket-open command
    pub const SOCKET_OPEN_IMMEDIATE_MS: u64 = 2000;

    /// Second read window, catching the delayed +CIPOPEN notification
    pub const SOCKET_OPEN_DELAYED_MS: u64 = 3000;

    /// How long to wait for the send prompt
    pub const SEND_PROMPT_TIMEOUT_MS: u64 = 5000;

    /// Dwell after writing a payload before reading the modem's reply
    pub const POST_SEND_SETTLE_MS: u64 = 3000;

    /// Dwell after closing the socket during teardown
    pub const SOCKET_CLOSE_SETTLE_MS: u64 = 2000;

    /// Sleep when no sensor line arrived
    pub const IDLE_DELAY_MS: u64 = 1000;

    /// Pause between processed sensor lines
    pub const LINE_DELAY_MS: u64 = 2000;
}

/// Protocol limits of the modem family
pub mod limits {
    /// Largest payload accepted by a single send announcement
    pub const MAX_SEND_BYTES: usize = 1500;

    /// Highest socket identifier the modem exposes
    pub const MAX_SOCKET_ID: u8 = 9;

    /// Longest unterminated sensor line kept in the read buffer
    pub const MAX_LINE_BYTES: usize = 4096;
}
