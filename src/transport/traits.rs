//! Serial link abstraction for the modem and sensor ports

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::Duration;

/// A duplex byte channel with partial reads and an input buffer that can be
/// inspected without blocking.
///
/// Every method takes `&mut self` or `&self` on a link owned by exactly one
/// component, so a command can never be written while another exchange on
/// the same link is still reading.
#[async_trait]
pub trait SerialLink: Send {
    /// Write every byte of `data`
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait up to `wait` for input; returns empty bytes when nothing arrived
    async fn read_chunk(&mut self, wait: Duration) -> io::Result<Bytes>;

    /// Take everything buffered right now without waiting
    async fn drain(&mut self) -> io::Result<Bytes>;

    /// Bytes waiting in the receive buffer
    fn bytes_available(&self) -> io::Result<usize>;

    /// Discard stale input
    fn clear_input(&mut self) -> io::Result<()>;

    /// Human-readable name for this link
    fn name(&self) -> &str;
}
