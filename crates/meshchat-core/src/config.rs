//! Configuration for the chat node
//!
//! Loaded from a JSON file (durations written as "100ms", "10s") and
//! overlaid with command line flags by the binary.

use meshchat_bridge::config::humantime_serde;
use meshchat_bridge::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};

/// Default overall bound on route and identity resolution
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 10_000;

/// Default spacing between route/identity checks while resolving
pub const DEFAULT_RESOLVE_POLL_MS: u64 = 100;

/// Default node name
pub const DEFAULT_NODE_NAME: &str = "meshchat";

/// Link session timing and channel sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Give up resolving a peer after this long
    #[serde(with = "humantime_serde", default = "default_resolve_timeout")]
    pub resolve_timeout: Duration,

    /// Interval between route/identity checks while resolving
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Interval between repeated route requests while resolving
    #[serde(with = "humantime_serde", default = "default_path_request_interval")]
    pub path_request_interval: Duration,

    /// Capacity of the session command channel
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Capacity of the session event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_resolve_timeout() -> Duration {
    Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(DEFAULT_RESOLVE_POLL_MS)
}

fn default_path_request_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_command_capacity() -> usize {
    64
}

fn default_event_capacity() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: default_resolve_timeout(),
            poll_interval: default_poll_interval(),
            path_request_interval: default_path_request_interval(),
            command_capacity: default_command_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Node name; the loopback mesh derives the node's identity from it
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Announce presence once the node is up
    #[serde(default)]
    pub announce_on_start: bool,

    /// Peer address (hex) to connect to at startup
    #[serde(default)]
    pub peer: Option<String>,

    /// Link session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Companion display bridge; `None` runs console-only
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
}

fn default_node_name() -> String {
    DEFAULT_NODE_NAME.to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            announce_on_start: false,
            peer: None,
            session: SessionConfig::default(),
            bridge: None,
        }
    }
}

impl ChatConfig {
    /// Parse from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ChatError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ChatError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(ChatError::InvalidConfig("node_name is empty".to_string()));
        }
        if self.session.poll_interval.is_zero() {
            return Err(ChatError::InvalidConfig(
                "session.poll_interval must be non-zero".to_string(),
            ));
        }
        if self.session.resolve_timeout < self.session.poll_interval {
            return Err(ChatError::InvalidConfig(
                "session.resolve_timeout is shorter than session.poll_interval".to_string(),
            ));
        }
        if self.session.command_capacity == 0 || self.session.event_capacity == 0 {
            return Err(ChatError::InvalidConfig(
                "session channel capacities must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for ChatConfig
#[derive(Debug, Default)]
pub struct ChatConfigBuilder {
    config: ChatConfig,
}

impl ChatConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set node name
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    /// Announce on startup
    pub fn announce_on_start(mut self, announce: bool) -> Self {
        self.config.announce_on_start = announce;
        self
    }

    /// Connect to this peer on startup
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.config.peer = Some(peer.into());
        self
    }

    /// Set resolution timeout
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.config.session.resolve_timeout = timeout;
        self
    }

    /// Set resolution poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.session.poll_interval = interval;
        self
    }

    /// Attach a companion display on `port`, keeping other bridge settings
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        let bridge = self.config.bridge.get_or_insert_with(BridgeConfig::default);
        bridge.serial.port = port.into();
        self
    }

    /// Set the full bridge configuration
    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.config.bridge = Some(bridge);
        self
    }

    /// Build the configuration
    pub fn build(self) -> ChatConfig {
        self.config
    }
}
