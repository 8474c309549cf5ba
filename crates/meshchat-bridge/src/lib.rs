//! Framed serial bridge to a companion display peripheral
//!
//! This crate moves short text and JSON control messages between a chat
//! node and a microcontroller display attached over a serial line. Both
//! directions run concurrently and survive unplug/replug of the device.
//!
//! # Architecture
//!
//! The bridge operates in three layers:
//!
//! 1. **Transport** - [`SerialTransport`] over a real port or a mock
//! 2. **Framing** - 4-byte ASCII tag, little-endian `u16` length, payload
//! 3. **Bridge** - [`SerialBridge`] with one outbound and one inbound worker
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: meshchat-bridge = { version = "0.1", features = ["serial"] }
//!
//! use meshchat_bridge::{BridgeConfigBuilder, SerialBridge, SerialPortTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BridgeConfigBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .baud_rate(115200)
//!         .build();
//!
//!     let transport = SerialPortTransport::from_config(&config.serial);
//!     let bridge = SerialBridge::start(
//!         transport,
//!         &config,
//!         Arc::new(|msg| {
//!             println!("peripheral says: {}", msg.text());
//!             Ok(())
//!         }),
//!     );
//!
//!     bridge.handle().send_text("hello display").ok();
//!     bridge.close().await;
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port transport (requires `libudev-dev` on Linux)
//!
//! # Protocol Details
//!
//! | Tag    | Direction  | Payload                         |
//! |--------|------------|---------------------------------|
//! | `TXTP` | to display | UTF-8 text line                 |
//! | `JCTL` | to display | JSON object (status/control)    |
//! | `TXIN` | from display | UTF-8 text or `:command` line |
//! | `EVNT` | from display | JSON object (legacy events)   |
//!
//! - Bytes 0-3: tag
//! - Bytes 4-5: payload length (little-endian u16, at most 60000)
//! - Bytes 6+: payload
//!
//! Frames carry no checksum; on an unrecognized tag or a bad length the
//! reader slides forward to the next position that could start an inbound
//! tag, so a frame that follows line noise is still delivered.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod queue;
pub mod transport;

pub mod test_utils;

pub use bridge::{BridgeHandle, BridgeStats, Inbound, InboundCallback, Outbound, SerialBridge};
pub use codec::{DecodeStep, Frame, FrameDecoder, FrameTag};
pub use config::{BridgeConfig, BridgeConfigBuilder, SerialConfig};
pub use error::{BridgeError, Result};
pub use queue::OutboundQueue;
pub use transport::{ConnectionState, SerialTransport};

#[cfg(feature = "serial")]
pub use transport::SerialPortTransport;

pub use test_utils::{MockWire, MockTransport};

pub use codec::{HEADER_LEN, MAX_PAYLOAD};
pub use config::{DEFAULT_BAUD_RATE, DEFAULT_QUEUE_CAPACITY};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(MAX_PAYLOAD, 60_000);
        assert_eq!(HEADER_LEN, 6);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(DEFAULT_QUEUE_CAPACITY, 100);
    }
}
