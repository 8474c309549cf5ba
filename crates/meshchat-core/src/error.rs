//! Chat-level error types
//!
//! Link errors are user-visible: they are reported as text on whichever
//! surface (console or peripheral) issued the action and never end the
//! process. Serial bridge errors stay inside the bridge and only reach
//! this type when the bridge itself cannot be started.

use meshchat_bridge::BridgeError;
use thiserror::Error;

/// Main error type for chat operations
#[derive(Error, Debug)]
pub enum ChatError {
    // ===== User Input Errors =====
    /// Malformed peer address
    #[error("Invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The rejected input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// Unrecognized or malformed command line
    #[error("Invalid command '{verb}': {reason}")]
    InvalidCommand {
        /// The command verb as typed
        verb: String,
        /// Why it was rejected
        reason: String,
    },

    // ===== Link Errors =====
    /// Route or identity not resolved before the deadline
    #[error("Peer {address} unreachable after {waited_ms}ms")]
    PeerUnreachable {
        /// Target address (hex)
        address: String,
        /// How long resolution was attempted
        waited_ms: u64,
    },

    /// Sending over the active link failed; the link was dropped
    #[error("Link send failed: {0}")]
    LinkSendFailure(String),

    /// A message was sent while no link is active
    #[error("No active link (state: {state})")]
    LinkNotActive {
        /// Session state at the time of the send
        state: String,
    },

    /// A newer connect replaced this one before it finished
    #[error("Connect to {address} superseded by a newer connect")]
    ConnectSuperseded {
        /// Target address of the abandoned connect (hex)
        address: String,
    },

    /// The session actor has stopped
    #[error("Session closed")]
    SessionClosed,

    // ===== Collaborator Errors =====
    /// The mesh stack reported a failure
    #[error("Mesh error: {0}")]
    Mesh(String),

    /// Serial bridge error
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Console I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}

impl ChatError {
    /// Check if retrying the same action may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ChatError::PeerUnreachable { .. }
                | ChatError::LinkSendFailure(_)
                | ChatError::LinkNotActive { .. }
                | ChatError::ConnectSuperseded { .. }
        ) || matches!(self, ChatError::Bridge(e) if e.is_retriable())
    }

    /// Check if this is caused by bad user input
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ChatError::InvalidAddress { .. } | ChatError::InvalidCommand { .. }
        )
    }

    /// Get error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            ChatError::InvalidAddress { .. } => "INVALID_ADDRESS",
            ChatError::InvalidCommand { .. } => "INVALID_COMMAND",
            ChatError::PeerUnreachable { .. } => "PEER_UNREACHABLE",
            ChatError::LinkSendFailure(_) => "LINK_SEND_FAILURE",
            ChatError::LinkNotActive { .. } => "LINK_NOT_ACTIVE",
            ChatError::ConnectSuperseded { .. } => "CONNECT_SUPERSEDED",
            ChatError::SessionClosed => "SESSION_CLOSED",
            ChatError::Mesh(_) => "MESH_ERROR",
            ChatError::Bridge(e) => e.error_code(),
            ChatError::Io(_) => "IO_ERROR",
            ChatError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }
}

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;
