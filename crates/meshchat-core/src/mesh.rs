//! Boundary onto the external mesh stack
//!
//! The mesh stack (path discovery, identities, encrypted links, radio
//! drivers) is consumed, not implemented, here. It reports link and packet
//! activity from its own execution context; [`MeshFacade::subscribe`]
//! turns those callbacks into [`MeshEvent`]s on a channel so the session
//! actor is the only place that reacts to them.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::address::{Address, LinkId, LinkQuality, PeerIdentity};
use crate::error::Result;

/// Events reported by the mesh stack
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A link finished establishing (outgoing or incoming)
    LinkEstablished {
        /// The link
        link: LinkId,
        /// Remote address if the stack knows it
        peer: Option<Address>,
        /// Whether this node opened the link
        initiator: bool,
    },

    /// A link was torn down
    LinkClosed {
        /// The link
        link: LinkId,
    },

    /// Data arrived over a link
    LinkPacket {
        /// The link
        link: LinkId,
        /// Raw payload
        data: Bytes,
    },

    /// Data arrived addressed to this node's destination, outside any link
    Packet {
        /// Raw payload
        data: Bytes,
    },
}

impl MeshEvent {
    /// Link this event concerns, if any
    pub fn link(&self) -> Option<LinkId> {
        match self {
            MeshEvent::LinkEstablished { link, .. }
            | MeshEvent::LinkClosed { link }
            | MeshEvent::LinkPacket { link, .. } => Some(*link),
            MeshEvent::Packet { .. } => None,
        }
    }
}

/// Sender side of a mesh event subscription
pub type MeshEventSink = mpsc::UnboundedSender<MeshEvent>;

/// Operations the chat core needs from the mesh stack
#[async_trait]
pub trait MeshFacade: Send + Sync {
    /// This node's own destination address
    fn own_address(&self) -> Address;

    /// Broadcast presence so peers can learn a route and identity
    async fn announce(&self) -> Result<()>;

    /// Whether a route to `address` is currently known
    async fn has_route(&self, address: &Address) -> bool;

    /// Ask the network for a route to `address`
    async fn request_route(&self, address: &Address) -> Result<()>;

    /// Recall a previously learned identity for `address`
    async fn recall_identity(&self, address: &Address) -> Option<PeerIdentity>;

    /// Begin opening a link; completion is reported as
    /// [`MeshEvent::LinkEstablished`]
    async fn open_link(&self, identity: &PeerIdentity) -> Result<LinkId>;

    /// Send bytes over an open link
    async fn send(&self, link: LinkId, data: &[u8]) -> Result<()>;

    /// Tear down a link; the stack reports [`MeshEvent::LinkClosed`]
    async fn close_link(&self, link: LinkId);

    /// Last physical-layer sample for a link
    async fn link_quality(&self, link: LinkId) -> Option<LinkQuality>;

    /// Register a sink for link and packet events
    fn subscribe(&self, sink: MeshEventSink);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_link() {
        let event = MeshEvent::LinkPacket {
            link: LinkId(3),
            data: Bytes::from_static(b"hi"),
        };
        assert_eq!(event.link(), Some(LinkId(3)));

        let event = MeshEvent::Packet {
            data: Bytes::from_static(b"hi"),
        };
        assert_eq!(event.link(), None);
    }
}
