//! Physical transports for the peripheral link
//!
//! - [`SerialPortTransport`] - real serial port (requires `serial` feature)
//! - [`crate::test_utils::MockTransport`] - scripted in-memory transport
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialPortTransport;

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;

/// Trait for byte transports to the peripheral
///
/// One instance is shared by both bridge workers, so every method takes
/// `&self`. Implementations keep the receive and transmit sides behind
/// separate locks: a read waiting for data never holds up a write.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    /// Open the underlying handle; a no-op if already open
    ///
    /// Implementations reset input/output buffers and clear flow-control
    /// lines so that opening does not reset the peripheral.
    async fn open(&self) -> Result<()>;

    /// Close and drop the underlying handle
    async fn close(&self);

    /// Check if the handle is currently open
    fn is_open(&self) -> bool;

    /// Read whatever is available, at most `max` bytes
    ///
    /// Waits at most `timeout` for the first byte and returns
    /// [`BridgeError::ReadTimeout`] if none arrived.
    async fn read_chunk(&self, max: usize, timeout: Duration) -> Result<Bytes>;

    /// Write all bytes and flush
    async fn write_all(&self, bytes: &[u8]) -> Result<()>;

    /// Drop everything currently buffered on the receive side
    async fn discard_input(&self) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;

    /// Read exactly `n` bytes, waiting at most `timeout`
    ///
    /// Returns [`BridgeError::ReadTimeout`] if fewer than `n` bytes
    /// arrived in time. Any partially read bytes are discarded, never
    /// returned.
    async fn read_exact(&self, n: usize, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::ReadTimeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            }
            let chunk = self.read_chunk(n - buf.len(), remaining).await?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Close and open again
    async fn reopen(&self) -> Result<()> {
        self.close().await;
        self.open().await
    }
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn test_default_reopen_cycles_handle() {
        let transport = MockTransport::new();
        let wire = transport.wire();

        transport.open().await.unwrap();
        transport.reopen().await.unwrap();

        assert!(transport.is_open());
        assert_eq!(wire.open_count(), 2);
        assert_eq!(wire.close_count(), 1);
    }

    #[tokio::test]
    async fn test_read_exact_assembles_chunks() {
        let transport = MockTransport::new();
        let wire = transport.wire();
        transport.open().await.unwrap();

        wire.feed(b"TX");
        let feeder = wire.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            feeder.feed(b"INrest");
        });

        let bytes = transport
            .read_exact(4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"TXIN");
        assert_eq!(wire.pending_input(), 4);
    }

    #[tokio::test]
    async fn test_read_exact_timeout_discards_partial() {
        let transport = MockTransport::new();
        let wire = transport.wire();
        transport.open().await.unwrap();

        wire.feed(b"TX");
        let err = transport
            .read_exact(4, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(wire.pending_input(), 0);
    }
}
