//! Serial port transport for the companion display
//!
//! Async serial communication using tokio-serial. The handle is opened
//! without asserting DTR/RTS (ESP32-class boards reset when those lines
//! toggle) and both kernel buffers are cleared so stale boot output does
//! not reach the frame decoder. The stream is then split into independent
//! read and write halves.

use crate::config::{SerialConfig, DEFAULT_BAUD_RATE};
use crate::error::{BridgeError, Result};
use crate::transport::{ConnectionState, SerialTransport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

/// How long `discard_input` waits for more stale bytes before stopping
const DISCARD_POLL: Duration = Duration::from_millis(5);

/// Upper bound on bytes dropped by one `discard_input` call
const DISCARD_LIMIT: usize = 64 * 1024;

/// Serial transport backed by a tokio-serial stream
///
/// The stream is split on open; the read half and the write half sit
/// behind their own locks so the two bridge workers never wait on each
/// other.
pub struct SerialPortTransport {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Receive side (when open)
    reader: AsyncMutex<Option<ReadHalf<SerialStream>>>,

    /// Transmit side (when open)
    writer: AsyncMutex<Option<WriteHalf<SerialStream>>>,

    /// Serializes concurrent open attempts from both workers
    opening: AsyncMutex<()>,

    /// Current connection state
    state: Mutex<ConnectionState>,

    /// Transport name for logging
    name: String,
}

impl SerialPortTransport {
    /// Create a new, not yet opened, serial transport
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            opening: AsyncMutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            name,
        }
    }

    /// Create from port settings
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(&config.port).with_baud_rate(config.baud_rate)
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn open(&self) -> Result<()> {
        let _opening = self.opening.lock().await;
        if self.is_open() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opening serial port");

        if !self.port_path.exists() {
            self.set_state(ConnectionState::Disconnected);
            return Err(BridgeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .open_native_async()
            .map_err(|e| {
                self.set_state(ConnectionState::Disconnected);
                BridgeError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
        let mut stream = stream;

        // Leave the modem-control lines low so the peripheral does not reboot
        if let Err(e) = stream.write_data_terminal_ready(false) {
            debug!(error = %e, "Could not clear DTR");
        }
        if let Err(e) = stream.write_request_to_send(false) {
            debug!(error = %e, "Could not clear RTS");
        }
        if let Err(e) = stream.clear(ClearBuffer::All) {
            warn!(error = %e, "Could not reset serial buffers");
        }

        let (reader, writer) = tokio::io::split(stream);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected);

        info!(port = %self.port_path.display(), "Serial port open");
        Ok(())
    }

    async fn close(&self) {
        self.set_state(ConnectionState::Disconnected);
        let had_writer = self.writer.lock().await.take().is_some();
        let had_reader = self.reader.lock().await.take().is_some();
        if had_writer || had_reader {
            info!(port = %self.port_path.display(), "Closed serial port");
        }
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn read_chunk(&self, max: usize, timeout: Duration) -> Result<Bytes> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(BridgeError::Disconnected)?;

        let mut buf = vec![0u8; max];
        match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                // EOF - device unplugged
                guard.take();
                self.set_state(ConnectionState::Disconnected);
                Err(BridgeError::Disconnected)
            }
            Ok(Ok(n)) => {
                trace!(bytes = n, "Read from serial port");
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => {
                error!(error = %e, "Serial read error");
                guard.take();
                self.set_state(ConnectionState::Disconnected);
                Err(BridgeError::ReadError(e.to_string()))
            }
            Err(_) => Err(BridgeError::ReadTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::Disconnected)?;

        debug!(size = bytes.len(), "Writing frame");

        if let Err(e) = writer.write_all(bytes).await {
            guard.take();
            self.set_state(ConnectionState::Disconnected);
            return Err(BridgeError::WriteError(e.to_string()));
        }

        if let Err(e) = writer.flush().await {
            guard.take();
            self.set_state(ConnectionState::Disconnected);
            return Err(BridgeError::WriteError(format!("Flush failed: {}", e)));
        }

        Ok(())
    }

    /// Drains bytes that are already readable; the write half is untouched
    async fn discard_input(&self) -> Result<()> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(BridgeError::Disconnected)?;

        let mut scratch = [0u8; 256];
        let mut dropped = 0;
        while dropped < DISCARD_LIMIT {
            match tokio::time::timeout(DISCARD_POLL, reader.read(&mut scratch)).await {
                Ok(Ok(0)) => {
                    guard.take();
                    self.set_state(ConnectionState::Disconnected);
                    return Err(BridgeError::Disconnected);
                }
                Ok(Ok(n)) => dropped += n,
                Ok(Err(e)) => {
                    guard.take();
                    self.set_state(ConnectionState::Disconnected);
                    return Err(BridgeError::ReadError(format!("Input discard failed: {}", e)));
                }
                Err(_) => break,
            }
        }

        debug!(dropped, "Discarded serial input");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialPortTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortTransport")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state() {
        let transport = SerialPortTransport::new("/dev/ttyUSB0");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!transport.is_open());
    }

    #[test]
    fn test_transport_name() {
        let transport = SerialPortTransport::new("/dev/ttyUSB0");
        assert_eq!(transport.name(), "serial:/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_open_missing_port() {
        let transport = SerialPortTransport::new("/dev/does-not-exist-meshchat");
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, BridgeError::PortNotFound(_)));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_read_without_open() {
        let transport = SerialPortTransport::new("/dev/ttyUSB0");
        let err = transport
            .read_exact(4, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected));
    }
}
