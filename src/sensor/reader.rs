//! Newline-framed reader for the sensor link

use crate::transport::SerialLink;
use bytes::{Buf, BytesMut};
use cellbridge_shared::limits::MAX_LINE_BYTES;
use std::io;
use std::time::Duration;
use tracing::warn;

/// What the sensor link produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    /// One trimmed, non-empty line
    Line(String),
    /// Nothing complete arrived within the read timeout
    Idle,
    /// The link is gone
    Closed,
}

/// Splits sensor input into lines, keeping partial lines across reads
pub struct LineReader<L> {
    link: L,
    buffer: BytesMut,
    read_timeout: Duration,
    /// Dropping the rest of an oversized line up to its terminator
    discarding: bool,
}

impl<L: SerialLink> LineReader<L> {
    pub fn new(link: L, read_timeout: Duration) -> Self {
        Self {
            link,
            buffer: BytesMut::with_capacity(256),
            read_timeout,
            discarding: false,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Release the link
    pub fn into_inner(self) -> L {
        self.link
    }

    /// Wait for the next line, at most one read timeout of silence
    pub async fn next_event(&mut self) -> io::Result<SensorEvent> {
        loop {
            if let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                return Ok(SensorEvent::Line(line));
            }

            match self.link.read_chunk(self.read_timeout).await {
                Ok(chunk) if chunk.is_empty() => return Ok(SensorEvent::Idle),
                Ok(chunk) => self.push_chunk(&chunk),
                Err(e) if is_closed(&e) => return Ok(SensorEvent::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Pop one complete line off the buffer
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw = self.buffer.split_to(pos);
        self.buffer.advance(1);
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn push_chunk(&mut self, mut chunk: &[u8]) {
        if self.discarding {
            let Some(pos) = chunk.iter().position(|&b| b == b'\n') else {
                return;
            };
            chunk = &chunk[pos + 1..];
            self.discarding = false;
        }
        self.buffer.extend_from_slice(chunk);
        self.enforce_limit();
    }

    /// Drop an unterminated line that outgrew the buffer limit, along with
    /// whatever of it is still to come
    fn enforce_limit(&mut self) {
        if self.buffer.len() > MAX_LINE_BYTES && !self.buffer.contains(&b'\n') {
            warn!(
                "[Sensor] Discarding {} bytes without a line terminator",
                self.buffer.len()
            );
            self.buffer.clear();
            self.discarding = true;
        }
    }
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}
