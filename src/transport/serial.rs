//! Serial port transport backed by tokio-serial

use crate::transport::traits::SerialLink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::debug;

/// Largest single read issued against the port
const READ_CHUNK: usize = 1024;

/// Configuration for one serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortConfig {
    /// Device path (e.g. "/dev/serial0" or "/dev/ttyUSB0")
    pub path: String,
    /// Baud rate
    pub baud: u32,
    /// Inactivity timeout for blocking reads
    pub read_timeout: Duration,
}

impl Default for SerialPortConfig {
    fn default() -> Self {
        Self {
            path: "/dev/serial0".into(),
            baud: 115_200,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// An open serial port implementing `SerialLink`
pub struct SerialPortLink {
    inner: SerialStream,
    name: String,
}

impl SerialPortLink {
    /// Open the port described by `config`
    pub fn open(config: &SerialPortConfig) -> Result<Self> {
        let inner = tokio_serial::new(&config.path, config.baud)
            .timeout(config.read_timeout)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port '{}'", config.path))?;

        debug!("[Serial] Opened {} at {} baud", config.path, config.baud);
        Ok(Self {
            inner,
            name: config.path.clone(),
        })
    }
}

#[async_trait]
impl SerialLink for SerialPortLink {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    async fn read_chunk(&mut self, wait: Duration) -> io::Result<Bytes> {
        let mut buf = vec![0u8; READ_CHUNK];
        match timeout(wait, self.inner.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Ok(Err(e)) => Err(e),
            // Nothing arrived inside the window
            Err(_) => Ok(Bytes::new()),
        }
    }

    async fn drain(&mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        loop {
            let pending = self.bytes_available()?;
            if pending == 0 {
                break;
            }
            let mut buf = vec![0u8; pending];
            let n = self.inner.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out.freeze())
    }

    fn bytes_available(&self) -> io::Result<usize> {
        Ok(self.inner.bytes_to_read()? as usize)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.inner.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
