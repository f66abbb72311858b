//! AT command/response exchange
//!
//! The modem mixes command echoes, final result codes and unsolicited
//! notifications on one loosely framed text channel. Matching is therefore
//! done by keyword containment over everything read so far, never by parsing
//! individual lines.

use crate::modem::commands::TERMINATOR;
use crate::transport::SerialLink;
use std::io;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Default slice used while polling for a keyword
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Request/response primitive over a modem link
pub struct AtExchange<L> {
    link: L,
    poll_interval: Duration,
}

impl<L: SerialLink> AtExchange<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Release the link
    pub fn into_inner(self) -> L {
        self.link
    }

    /// Write `command`, dwell for `settle`, then return whatever arrived.
    ///
    /// The dwell is a heuristic, not a completion guarantee; callers search
    /// the returned text for the markers they expect.
    pub async fn send(&mut self, command: &str, settle: Duration) -> io::Result<String> {
        self.write_command(command).await?;
        self.collect(settle).await
    }

    /// Write `command` plus the line terminator without reading anything back
    pub async fn write_command(&mut self, command: &str) -> io::Result<()> {
        debug!("[AT] >> {}", command);
        let line = format!("{}{}", command, TERMINATOR);
        self.link.write_all(line.as_bytes()).await
    }

    /// Dwell for `dwell`, then drain and decode everything buffered
    pub async fn collect(&mut self, dwell: Duration) -> io::Result<String> {
        sleep(dwell).await;
        let raw = self.link.drain().await?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        debug!("[AT] << {:?}", text);
        Ok(text)
    }

    /// Poll input until `keyword` shows up or `timeout` elapses.
    ///
    /// Garbled or partial input is never an error here; only I/O failures on
    /// the link are. `false` means the deadline passed without a match.
    pub async fn await_keyword(&mut self, keyword: &str, timeout: Duration) -> io::Result<bool> {
        let needle = keyword.as_bytes();
        let deadline = Instant::now() + timeout;
        let mut seen: Vec<u8> = Vec::new();

        loop {
            if contains(&seen, needle) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let slice = self.poll_interval.min(deadline - now);
            let chunk = self.link.read_chunk(slice).await?;
            seen.extend_from_slice(&chunk);
        }

        warn!(
            "[AT] Timed out waiting for '{}' (saw {:?})",
            keyword,
            String::from_utf8_lossy(&seen)
        );
        Ok(false)
    }

    /// Write raw payload bytes in one operation, no terminator
    pub async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.link.write_all(data).await
    }

    /// Drop stale input before a new exchange
    pub fn clear_input(&mut self) -> io::Result<()> {
        self.link.clear_input()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}
