//! Test utilities for exercising the bridge without hardware
//!
//! [`MockTransport`] behaves like a serial port whose receive side is fed
//! by the test: bytes pushed with [`MockWire::feed`] become readable in
//! whatever chunks the reader asks for, and
//! [`SerialTransport::discard_input`] throws away whatever is buffered.
//! Writes are captured for inspection and faults can be injected on open,
//! read and write.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshchat_bridge::test_utils::MockTransport;
//!
//! let transport = MockTransport::new();
//! let wire = transport.wire();
//! wire.feed_frame(FrameTag::TextIn, b":me")?;
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{self, Frame, FrameTag};
use crate::error::{BridgeError, Result};
use crate::transport::SerialTransport;

/// Granularity at which a blocked mock read re-checks its buffer
const MOCK_READ_STEP: Duration = Duration::from_millis(2);

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    rx: VecDeque<u8>,
    written: Vec<Bytes>,
    fail_opens: usize,
    fail_writes: usize,
    fail_reads: usize,
    open_count: usize,
    close_count: usize,
    discard_count: usize,
}

/// Scripted in-memory serial transport
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new, closed mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the far end of the mock line, for feeding input and inspecting output after the
    /// transport has been moved into a bridge
    pub fn wire(&self) -> MockWire {
        MockWire {
            state: self.state.clone(),
        }
    }
}

/// Shared view into a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockWire {
    state: Arc<Mutex<MockState>>,
}

impl MockWire {
    /// Make raw bytes readable on the receive side
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    /// Make an encoded frame readable on the receive side
    pub fn feed_frame(&self, tag: FrameTag, payload: &[u8]) -> Result<()> {
        let framed = codec::encode(tag, payload)?;
        self.feed(&framed);
        Ok(())
    }

    /// Number of bytes buffered and not yet read
    pub fn pending_input(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// Raw writes captured so far
    pub fn written(&self) -> Vec<Bytes> {
        self.state.lock().written.clone()
    }

    /// Captured writes decoded as frames
    pub fn written_frames(&self) -> Vec<Frame> {
        self.written()
            .iter()
            .filter_map(|raw| codec::decode(raw).ok().map(|(frame, _)| frame))
            .collect()
    }

    /// Fail the next `n` open attempts
    pub fn fail_opens(&self, n: usize) {
        self.state.lock().fail_opens = n;
    }

    /// Fail the next `n` writes (each failure also closes the handle)
    pub fn fail_writes(&self, n: usize) {
        self.state.lock().fail_writes = n;
    }

    /// Fail the next `n` reads (each failure also closes the handle)
    pub fn fail_reads(&self, n: usize) {
        self.state.lock().fail_reads = n;
    }

    /// Whether the mock handle is currently open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Number of closes
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Number of input discards (resyncs)
    pub fn discard_count(&self) -> usize {
        self.state.lock().discard_count
    }
}

#[async_trait::async_trait]
impl SerialTransport for MockTransport {
    async fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(BridgeError::PortOpenFailed {
                port: "mock".to_string(),
                reason: "Simulated open failure".to_string(),
            });
        }
        if !state.open {
            state.open = true;
            state.open_count += 1;
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.close_count += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn read_chunk(&self, max: usize, timeout: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if !state.open {
                    return Err(BridgeError::Disconnected);
                }
                if state.fail_reads > 0 {
                    state.fail_reads -= 1;
                    state.open = false;
                    return Err(BridgeError::ReadError("Simulated read failure".to_string()));
                }
                if !state.rx.is_empty() {
                    let n = state.rx.len().min(max);
                    let bytes: Vec<u8> = state.rx.drain(..n).collect();
                    trace!(bytes = n, "Mock read");
                    return Ok(Bytes::from(bytes));
                }
                if Instant::now() >= deadline {
                    return Err(BridgeError::ReadTimeout {
                        duration_ms: timeout.as_millis() as u64,
                    });
                }
            }
            tokio::time::sleep(MOCK_READ_STEP).await;
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(BridgeError::Disconnected);
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            state.open = false;
            return Err(BridgeError::WriteError("Simulated write failure".to_string()));
        }
        state.written.push(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn discard_input(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(BridgeError::Disconnected);
        }
        state.rx.clear();
        state.discard_count += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_open_close() {
        let mock = MockTransport::new();
        assert!(!mock.is_open());

        mock.open().await.unwrap();
        assert!(mock.is_open());

        mock.close().await;
        assert!(!mock.is_open());
    }

    #[tokio::test]
    async fn test_mock_read_write() {
        let mock = MockTransport::new();
        let wire = mock.wire();
        mock.open().await.unwrap();

        mock.write_all(&[1, 2, 3]).await.unwrap();
        assert_eq!(wire.written().len(), 1);

        wire.feed(&[4, 5, 6, 7]);
        let bytes = mock
            .read_exact(3, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), &[4, 5, 6]);
        assert_eq!(wire.pending_input(), 1);
    }

    #[tokio::test]
    async fn test_mock_read_chunk() {
        let mock = MockTransport::new();
        let wire = mock.wire();
        mock.open().await.unwrap();

        wire.feed(b"abcdef");
        let chunk = mock.read_chunk(4, Duration::from_millis(20)).await.unwrap();
        assert_eq!(chunk.as_ref(), b"abcd");
        let chunk = mock.read_chunk(64, Duration::from_millis(20)).await.unwrap();
        assert_eq!(chunk.as_ref(), b"ef");

        let err = mock
            .read_chunk(64, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_mock_simulated_failures() {
        let mock = MockTransport::new();
        let wire = mock.wire();

        wire.fail_opens(1);
        assert!(mock.open().await.is_err());
        mock.open().await.unwrap();

        wire.fail_writes(1);
        assert!(mock.write_all(b"x").await.is_err());
        assert!(!mock.is_open());
    }
}
