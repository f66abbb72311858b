//! Bridge configuration
//!
//! Loaded from TOML into an all-optional input struct, overlaid with
//! command-line overrides, then resolved into a validated `BridgeConfig`.
//!
//! ```toml
//! [modem]
//! port = "/dev/serial0"
//! apn = "internet.example"
//! host = "telemetry.example.net"
//!
//! [sensor]
//! port = "/dev/ttyUSB0"
//! policy = "accumulating"
//! required_keys = ["SPEED", "TEMP", "GEAR", "FUEL", "RPM"]
//!
//! [http]
//! method = "post"
//! path = "/api/data"
//! ```

use crate::modem::{ModemConfig, ModemTimings, RetryPolicy};
use crate::transport::SerialPortConfig;
use crate::uplink::PipelineTimings;
use anyhow::{bail, Context, Result};
use cellbridge_shared::{limits, timing, AliasTable, FramePolicy, HttpMethod, TelemetryEncoder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_MODEM_PORT: &str = "/dev/serial0";
pub const DEFAULT_SENSOR_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_APN: &str = "internet";
pub const DEFAULT_PATH: &str = "/api/data";

/// How sensor lines are grouped into frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Each line is a complete comma-separated frame
    #[default]
    Line,
    /// One pair per line until the required keys are all present
    Accumulating,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfigInput {
    pub modem: ModemInput,
    pub sensor: SensorInput,
    pub http: HttpInput,
    pub timing: TimingInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModemInput {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub apn: Option<String>,
    pub host: Option<String>,
    pub remote_port: Option<u16>,
    pub socket_id: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SensorInput {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub policy: Option<PolicyKind>,
    pub required_keys: Vec<String>,
    pub accepted_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpInput {
    pub method: Option<HttpMethod>,
    pub path: Option<String>,
    /// `alias = "canonical"`; replaces the built-in `temp = "temperature"`
    pub aliases: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingInput {
    pub read_timeout_ms: Option<u64>,
    pub keyword_poll_ms: Option<u64>,
    pub local_settle_ms: Option<u64>,
    pub apn_settle_ms: Option<u64>,
    pub bearer_close_settle_ms: Option<u64>,
    pub bearer_open_settle_ms: Option<u64>,
    pub attach_attempts: Option<u32>,
    pub attach_backoff_ms: Option<u64>,
    pub socket_open_immediate_ms: Option<u64>,
    pub socket_open_delayed_ms: Option<u64>,
    pub send_prompt_timeout_ms: Option<u64>,
    pub post_send_settle_ms: Option<u64>,
    pub socket_close_settle_ms: Option<u64>,
    pub idle_delay_ms: Option<u64>,
    pub line_delay_ms: Option<u64>,
}

/// Values given on the command line; each one wins over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub modem_port: Option<String>,
    pub sensor_port: Option<String>,
    pub apn: Option<String>,
    pub host: Option<String>,
    pub method: Option<HttpMethod>,
    pub policy: Option<PolicyKind>,
}

/// Pacing of the main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    /// Sleep when no sensor line arrived
    pub idle_delay: Duration,
    /// Pause after each processed line
    pub line_delay: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_millis(timing::IDLE_DELAY_MS),
            line_delay: Duration::from_millis(timing::LINE_DELAY_MS),
        }
    }
}

/// Validated configuration for the whole bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub modem_port: SerialPortConfig,
    pub sensor_port: SerialPortConfig,
    pub modem: ModemConfig,
    pub keyword_poll: Duration,
    pub frame_policy: FramePolicy,
    pub method: HttpMethod,
    pub path: String,
    pub aliases: AliasTable,
    pub pipeline: PipelineTimings,
    pub loop_timing: LoopTimings,
}

impl BridgeConfigInput {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(port) = overrides.modem_port {
            self.modem.port = Some(port);
        }
        if let Some(port) = overrides.sensor_port {
            self.sensor.port = Some(port);
        }
        if let Some(apn) = overrides.apn {
            self.modem.apn = Some(apn);
        }
        if let Some(host) = overrides.host {
            self.modem.host = Some(host);
        }
        if let Some(method) = overrides.method {
            self.http.method = Some(method);
        }
        if let Some(policy) = overrides.policy {
            self.sensor.policy = Some(policy);
        }
    }

    pub fn resolve(self) -> Result<BridgeConfig> {
        let t = &self.timing;
        let ms = |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));

        let read_timeout = ms(t.read_timeout_ms, timing::READ_TIMEOUT_MS);

        let apn = match self.modem.apn.as_deref().map(str::trim) {
            None => DEFAULT_APN,
            Some("") => bail!("modem.apn must not be empty"),
            Some(apn) => apn,
        };
        let Some(host) = non_empty(self.modem.host.as_deref()) else {
            bail!("modem.host is required");
        };
        let socket_id = self.modem.socket_id.unwrap_or(0);
        if socket_id > limits::MAX_SOCKET_ID {
            bail!(
                "modem.socket_id {} out of range (0-{})",
                socket_id,
                limits::MAX_SOCKET_ID
            );
        }
        let attach_attempts = t.attach_attempts.unwrap_or(timing::ATTACH_MAX_ATTEMPTS);
        if attach_attempts == 0 {
            bail!("timing.attach_attempts must be at least 1");
        }

        let modem = ModemConfig {
            apn: apn.to_string(),
            host: host.to_string(),
            port: self.modem.remote_port.unwrap_or(80),
            socket_id,
            timings: ModemTimings {
                local_settle: ms(t.local_settle_ms, timing::LOCAL_SETTLE_MS),
                apn_settle: ms(t.apn_settle_ms, timing::APN_SETTLE_MS),
                bearer_close_settle: ms(t.bearer_close_settle_ms, timing::BEARER_CLOSE_SETTLE_MS),
                bearer_open_settle: ms(t.bearer_open_settle_ms, timing::BEARER_OPEN_SETTLE_MS),
                socket_open_immediate: ms(
                    t.socket_open_immediate_ms,
                    timing::SOCKET_OPEN_IMMEDIATE_MS,
                ),
                socket_open_delayed: ms(t.socket_open_delayed_ms, timing::SOCKET_OPEN_DELAYED_MS),
                socket_close_settle: ms(t.socket_close_settle_ms, timing::SOCKET_CLOSE_SETTLE_MS),
                attach: RetryPolicy::new(
                    attach_attempts,
                    ms(t.attach_backoff_ms, timing::ATTACH_BACKOFF_MS),
                ),
            },
        };

        let frame_policy = match self.sensor.policy.unwrap_or_default() {
            PolicyKind::Line => {
                FramePolicy::line_atomic().with_accepted_keys(&self.sensor.accepted_keys)
            }
            PolicyKind::Accumulating => {
                let policy = FramePolicy::accumulating(&self.sensor.required_keys)
                    .with_accepted_keys(&self.sensor.accepted_keys);
                if matches!(&policy, FramePolicy::Accumulating { required_keys, .. } if required_keys.is_empty())
                {
                    bail!("sensor.required_keys must not be empty for the accumulating policy");
                }
                policy
            }
        };

        let aliases = match self.http.aliases {
            Some(map) => AliasTable::new(map).context("invalid http.aliases")?,
            None => AliasTable::default(),
        };

        Ok(BridgeConfig {
            modem_port: SerialPortConfig {
                path: self
                    .modem
                    .port
                    .unwrap_or_else(|| DEFAULT_MODEM_PORT.to_string()),
                baud: self.modem.baud.unwrap_or(DEFAULT_BAUD),
                read_timeout,
            },
            sensor_port: SerialPortConfig {
                path: self
                    .sensor
                    .port
                    .unwrap_or_else(|| DEFAULT_SENSOR_PORT.to_string()),
                baud: self.sensor.baud.unwrap_or(DEFAULT_BAUD),
                read_timeout,
            },
            modem,
            keyword_poll: ms(t.keyword_poll_ms, timing::KEYWORD_POLL_MS),
            frame_policy,
            method: self.http.method.unwrap_or_default(),
            path: self
                .http
                .path
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PATH.to_string()),
            aliases,
            pipeline: PipelineTimings {
                prompt_timeout: ms(t.send_prompt_timeout_ms, timing::SEND_PROMPT_TIMEOUT_MS),
                post_send_settle: ms(t.post_send_settle_ms, timing::POST_SEND_SETTLE_MS),
            },
            loop_timing: LoopTimings {
                idle_delay: ms(t.idle_delay_ms, timing::IDLE_DELAY_MS),
                line_delay: ms(t.line_delay_ms, timing::LINE_DELAY_MS),
            },
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl BridgeConfig {
    pub fn parse_toml(input: &str) -> Result<BridgeConfigInput> {
        if input.trim().is_empty() {
            return Ok(BridgeConfigInput::default());
        }
        toml::from_str(input).context("Invalid config TOML")
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        Self::parse_toml(input)?.resolve()
    }

    /// Read and parse a config file, leaving overrides to the caller
    pub fn load_input(path: &Path) -> Result<BridgeConfigInput> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse_toml(&text)
    }

    /// Encoder for the configured request shape
    pub fn encoder(&self) -> TelemetryEncoder {
        TelemetryEncoder::new(self.method, self.modem.host.clone(), self.path.clone())
            .with_port(self.modem.port)
            .with_aliases(self.aliases.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_need_only_host() {
        let cfg = BridgeConfig::from_toml_str("[modem]\nhost = \"example.net\"\n")
            .expect("config should resolve");

        assert_eq!(cfg.modem_port.path, DEFAULT_MODEM_PORT);
        assert_eq!(cfg.sensor_port.path, DEFAULT_SENSOR_PORT);
        assert_eq!(cfg.modem_port.baud, 115_200);
        assert_eq!(cfg.modem.apn, DEFAULT_APN);
        assert_eq!(cfg.modem.port, 80);
        assert_eq!(cfg.modem.socket_id, 0);
        assert_eq!(cfg.modem.timings, ModemTimings::default());
        assert_eq!(cfg.method, HttpMethod::Post);
        assert_eq!(cfg.path, DEFAULT_PATH);
        assert_eq!(cfg.frame_policy, FramePolicy::line_atomic());
        assert_eq!(cfg.pipeline, PipelineTimings::default());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [modem]
            port = "/dev/ttyAMA0"
            apn = "internet.example"
            host = "telemetry.example.net"
            remote_port = 8080
            socket_id = 2

            [sensor]
            port = "/dev/ttyUSB5"
            baud = 57600
            policy = "accumulating"
            required_keys = ["speed", "TEMP", "gear", "fuel", "rpm"]

            [http]
            method = "get"
            path = "/endpoint.php"
            aliases = { temp = "temperature", v = "voltage" }

            [timing]
            send_prompt_timeout_ms = 1000
            attach_attempts = 5
            line_delay_ms = 0
        "#;
        let cfg = BridgeConfig::from_toml_str(toml).expect("config should resolve");

        assert_eq!(cfg.modem_port.path, "/dev/ttyAMA0");
        assert_eq!(cfg.sensor_port.baud, 57600);
        assert_eq!(cfg.modem.socket_id, 2);
        assert_eq!(cfg.modem.port, 8080);
        assert_eq!(cfg.modem.timings.attach.max_attempts, 5);
        assert_eq!(cfg.method, HttpMethod::Get);
        assert_eq!(cfg.pipeline.prompt_timeout, Duration::from_secs(1));
        assert_eq!(cfg.loop_timing.line_delay, Duration::ZERO);
        assert_eq!(
            cfg.frame_policy,
            FramePolicy::accumulating(["SPEED", "TEMP", "GEAR", "FUEL", "RPM"])
        );
    }

    #[test]
    fn test_overrides_win() {
        let mut input = BridgeConfig::parse_toml("[modem]\nhost = \"a.example\"\napn = \"x\"\n")
            .expect("valid toml");
        input.apply(Overrides {
            host: Some("b.example".into()),
            method: Some(HttpMethod::Get),
            policy: Some(PolicyKind::Line),
            ..Default::default()
        });
        let cfg = input.resolve().expect("config should resolve");

        assert_eq!(cfg.modem.host, "b.example");
        assert_eq!(cfg.modem.apn, "x");
        assert_eq!(cfg.method, HttpMethod::Get);
    }

    #[test]
    fn test_validation_errors() {
        assert!(BridgeConfig::from_toml_str("").is_err());
        assert!(BridgeConfig::from_toml_str("[modem]\nhost = \"h\"\nsocket_id = 10\n").is_err());
        assert!(BridgeConfig::from_toml_str("[modem]\nhost = \"h\"\napn = \"\"\n").is_err());
        assert!(BridgeConfig::from_toml_str("[modem]\nhost = \"h\"\napn = \"  \"\n").is_err());
        assert!(BridgeConfig::from_toml_str("[modem]\nhost = \" \"\n").is_err());
        assert!(BridgeConfig::from_toml_str(
            "[modem]\nhost = \"h\"\n[sensor]\npolicy = \"accumulating\"\n"
        )
        .is_err());
        assert!(BridgeConfig::from_toml_str(
            "[modem]\nhost = \"h\"\n[timing]\nattach_attempts = 0\n"
        )
        .is_err());
        assert!(BridgeConfig::from_toml_str(
            "[modem]\nhost = \"h\"\n[http]\naliases = { a = \"b\", b = \"a\" }\n"
        )
        .is_err());
    }

    #[test]
    fn test_encoder_follows_method() {
        let cfg = BridgeConfig::from_toml_str(
            "[modem]\nhost = \"example.net\"\nremote_port = 8080\n[http]\nmethod = \"get\"\n",
        )
        .expect("config should resolve");
        let encoder = cfg.encoder();
        assert_eq!(encoder.method(), HttpMethod::Get);
    }
}
