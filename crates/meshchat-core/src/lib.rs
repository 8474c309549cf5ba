//! Peer-to-peer text chat over a link-oriented mesh
//!
//! This crate turns a peer's address into an active bidirectional link,
//! routes console and peripheral input to it, and mirrors everything that
//! happens onto an optional companion display attached through
//! [`meshchat_bridge`].
//!
//! # Architecture
//!
//! 1. **Mesh boundary** - [`MeshFacade`] over the external mesh stack,
//!    with [`LoopbackNetwork`] as an in-process implementation
//! 2. **Link lifecycle** - [`LinkSession`] actor owning the current link
//! 3. **Commands** - [`Command`] parsing and [`CommandRouter`] dispatch
//! 4. **Composition** - [`ChatNode`] wiring console, peripheral and session
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshchat_core::{ChatConfigBuilder, ChatNode, LoopbackNetwork};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshchat_core::Result<()> {
//!     let network = LoopbackNetwork::new();
//!     let config = ChatConfigBuilder::new().node_name("alice").build();
//!     let node = ChatNode::new(config, Arc::new(network.node("alice")));
//!
//!     let stdin = tokio::io::BufReader::new(tokio::io::stdin());
//!     node.run(stdin, tokio::io::stdout()).await
//! }
//! ```
//!
//! # Commands
//!
//! | Line              | Effect                              |
//! |-------------------|-------------------------------------|
//! | `:me`             | show own address                    |
//! | `:announce`       | broadcast presence                  |
//! | `:connect <hex>`  | resolve the peer and open a link    |
//! | `:rssi`           | show link quality                   |
//! | `:help`           | list commands                       |
//! | `:quit`           | exit                                |
//! | anything else     | message over the active link        |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod address;
pub mod command;
pub mod config;
pub mod error;
pub mod loopback;
pub mod mesh;
pub mod node;
pub mod session;

pub use address::{Address, LinkId, LinkQuality, PeerIdentity, ADDRESS_LEN};
pub use command::{Command, CommandRouter, Reply, Surface};
pub use config::{ChatConfig, ChatConfigBuilder, SessionConfig};
pub use error::{ChatError, Result};
pub use loopback::{LoopbackMesh, LoopbackNetwork, SentPacket};
pub use mesh::{MeshEvent, MeshEventSink, MeshFacade};
pub use node::{peripheral_line, ChatNode};
pub use session::{
    LinkSession, MessageVia, SessionEvent, SessionHandle, SessionSnapshot, SessionState,
};

pub use config::{DEFAULT_RESOLVE_POLL_MS, DEFAULT_RESOLVE_TIMEOUT_MS};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
