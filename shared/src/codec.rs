//! HTTP telemetry codec
//!
//! Converts a completed sensor frame into the exact bytes written to the
//! modem's TCP socket. Two request shapes are supported:
//!
//! ```text
//! POST <path> HTTP/1.1\r\n            GET <path>?speed=50&temperature=36.2 HTTP/1.1\r\n
//! Host: <host>\r\n                    Host: <host>\r\n
//! Connection: keep-alive\r\n          Connection: keep-alive\r\n
//! Content-Type: application/json\r\n  \r\n
//! Content-Length: <body bytes>\r\n
//! \r\n
//! [{"sensor_type":"speed","value":50.0},...]
//! ```
//!
//! The modem is told the payload length up front, so every length here is a
//! byte count of the encoded output, never a character count.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::SensorFrame;
use crate::limits::MAX_SEND_BYTES;

/// Errors that can occur while encoding telemetry
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Sensor alias cycle through '{0}'")]
    AliasCycle(String),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Request shape sent to the remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    /// JSON array body
    #[default]
    Post,
    /// Readings as query parameters
    Get,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Get => write!(f, "GET"),
        }
    }
}

/// Maps short sensor names onto canonical ones (`temp` -> `temperature`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTable {
    map: BTreeMap<String, String>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert("temp".to_string(), "temperature".to_string());
        Self { map }
    }
}

impl AliasTable {
    /// Build a table from `alias -> canonical` pairs, rejecting cycles
    pub fn new<I, K, V>(pairs: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let map: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (fold(k.as_ref()), fold(v.as_ref())))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty() && k != v)
            .collect();
        let table = Self { map };

        for alias in table.map.keys() {
            let resolved = table.resolve(alias);
            if table.map.contains_key(&resolved) {
                return Err(CodecError::AliasCycle(alias.clone()));
            }
        }
        Ok(table)
    }

    /// Empty table, names pass through unchanged apart from case folding
    pub fn none() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Follow aliases until a canonical name is reached
    fn resolve(&self, name: &str) -> String {
        let mut current = name.to_string();
        // A chain can't be longer than the table without looping
        for _ in 0..=self.map.len() {
            match self.map.get(&current) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        current
    }
}

fn fold(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Canonical sensor type for a raw frame key. Idempotent.
pub fn normalize_sensor_type(raw: &str, aliases: &AliasTable) -> String {
    aliases.resolve(&fold(raw))
}

/// One typed reading as it appears in the POST body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_type: String,
    pub value: f64,
}

/// A frame entry whose value was not a finite number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedValue {
    pub key: String,
    pub value: String,
}

/// Immutable bytes handed to the modem, length known up front
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPayload {
    bytes: Bytes,
}

impl TelemetryPayload {
    /// Encoded length in bytes; this is what the send announcement carries
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lossy text view for logging
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Result of encoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    /// A request is ready to send
    Ready {
        payload: TelemetryPayload,
        readings: Vec<SensorReading>,
        rejected: Vec<RejectedValue>,
    },
    /// No entry survived numeric parsing; nothing goes on the wire
    NothingToSend { rejected: Vec<RejectedValue> },
}

/// Builds HTTP requests for the remote endpoint
#[derive(Debug, Clone)]
pub struct TelemetryEncoder {
    method: HttpMethod,
    host_header: String,
    path: String,
    aliases: AliasTable,
}

impl TelemetryEncoder {
    /// Create an encoder for `host` on the default HTTP port
    pub fn new(method: HttpMethod, host: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method,
            host_header: host.into(),
            path: if path.is_empty() { "/".to_string() } else { path },
            aliases: AliasTable::default(),
        }
    }

    /// Name a non-default port in the Host header
    pub fn with_port(mut self, port: u16) -> Self {
        if port != 80 && !self.host_header.contains(':') {
            self.host_header = format!("{}:{}", self.host_header, port);
        }
        self
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Parse every frame value, keeping finite numbers only
    pub fn readings(&self, frame: &SensorFrame) -> (Vec<SensorReading>, Vec<RejectedValue>) {
        let mut readings = Vec::with_capacity(frame.len());
        let mut rejected = Vec::new();

        for (key, raw) in frame.iter() {
            match parse_value(raw) {
                Some(value) => readings.push(SensorReading {
                    sensor_type: normalize_sensor_type(key, &self.aliases),
                    value,
                }),
                None => rejected.push(RejectedValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
            }
        }
        (readings, rejected)
    }

    /// Encode a frame into a complete HTTP/1.1 request
    pub fn encode(&self, frame: &SensorFrame) -> Result<EncodeOutcome, CodecError> {
        let (readings, rejected) = self.readings(frame);
        if readings.is_empty() {
            return Ok(EncodeOutcome::NothingToSend { rejected });
        }

        let bytes = match self.method {
            HttpMethod::Post => self.encode_post(&readings)?,
            HttpMethod::Get => self.encode_get(&readings),
        };

        if bytes.len() > MAX_SEND_BYTES {
            return Err(CodecError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_SEND_BYTES,
            });
        }

        Ok(EncodeOutcome::Ready {
            payload: TelemetryPayload { bytes },
            readings,
            rejected,
        })
    }

    fn encode_post(&self, readings: &[SensorReading]) -> Result<Bytes, CodecError> {
        let body = serde_json::to_vec(readings)?;
        let head = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: keep-alive\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             \r\n",
            self.path,
            self.host_header,
            body.len()
        );

        let mut buf = BytesMut::with_capacity(head.len() + body.len());
        buf.put_slice(head.as_bytes());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn encode_get(&self, readings: &[SensorReading]) -> Bytes {
        let query = readings
            .iter()
            .map(|r| {
                format!(
                    "{}={}",
                    urlencoding::encode(&r.sensor_type),
                    urlencoding::encode(&r.value.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.path.ends_with('?') || self.path.ends_with('&') {
            ""
        } else if self.path.contains('?') {
            "&"
        } else {
            "?"
        };

        let request = format!(
            "GET {}{}{} HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: keep-alive\r\n\
             \r\n",
            self.path, separator, query, self.host_header
        );
        Bytes::from(request)
    }
}

/// Parse a raw sensor value; non-finite numbers count as unparseable
fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
