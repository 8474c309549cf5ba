//! Configuration types for the serial bridge
//!
//! Port settings plus the timing knobs of the two bridge workers. Every
//! wait the workers perform is bounded by one of these values so that
//! shutdown latency stays bounded.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default baud rate for companion display peripherals
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default wait for each read from the port
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 200;

/// Default minimum spacing between repeated I/O error logs
pub const DEFAULT_ERROR_LOG_INTERVAL_MS: u64 = 2000;

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
    pub port: PathBuf,
    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Bridge behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serial port settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Capacity of the outbound queue (oldest item dropped on overflow)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the outbound worker waits for an item before re-checking the stop flag
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// How long one read waits for bytes before the worker re-checks the stop flag
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// How long an incomplete frame may sit in the receive buffer
    #[serde(with = "humantime_serde", default = "default_payload_timeout")]
    pub payload_timeout: Duration,

    /// Pause after an I/O failure before the transport is reopened
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// Minimum spacing between repeated I/O error log lines
    #[serde(with = "humantime_serde", default = "default_error_log_interval")]
    pub error_log_interval: Duration,

    /// How long `close()` waits for each worker before aborting it
    #[serde(with = "humantime_serde", default = "default_join_timeout")]
    pub join_timeout: Duration,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_payload_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_error_log_interval() -> Duration {
    Duration::from_millis(DEFAULT_ERROR_LOG_INTERVAL_MS)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: default_poll_interval(),
            read_timeout: default_read_timeout(),
            payload_timeout: default_payload_timeout(),
            reconnect_delay: default_reconnect_delay(),
            error_log_interval: default_error_log_interval(),
            join_timeout: default_join_timeout(),
        }
    }
}

impl BridgeConfig {
    /// Configuration with short timings, suited to tests against mock transports
    pub fn fast() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(20),
            payload_timeout: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(10),
            join_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.serial.port = port.into();
        self
    }

    /// Set baud rate
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.serial.baud_rate = baud_rate;
        self
    }

    /// Set outbound queue capacity (at least one slot)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    /// Set the per-read wait
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set how long an incomplete frame is kept
    pub fn payload_timeout(mut self, timeout: Duration) -> Self {
        self.config.payload_timeout = timeout;
        self
    }

    /// Set the outbound poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

/// Serde helpers for `Duration` fields written as human-readable strings ("200ms", "2s")
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as a humantime string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    /// Deserialize a duration from a humantime string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
