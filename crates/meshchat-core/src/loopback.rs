//! In-process mesh for tests and demonstrations
//!
//! A [`LoopbackNetwork`] is a hub shared by any number of
//! [`LoopbackMesh`] nodes. Announcing makes a node routable and its
//! identity recallable by everyone else. Links open instantly and report
//! [`MeshEvent::LinkEstablished`] to both ends. Every link send is recorded
//! so tests can assert on exactly what crossed the "air".
//!
//! Faults are injected through the network: failing sends, closing links
//! and setting phy-quality samples.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::address::{Address, LinkId, LinkQuality, PeerIdentity};
use crate::error::{ChatError, Result};
use crate::mesh::{MeshEvent, MeshEventSink, MeshFacade};

/// One send recorded by the loopback network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    /// Link the data was sent over, `None` for a bare packet
    pub link: Option<LinkId>,
    /// Sending node
    pub from: Address,
    /// Receiving node
    pub to: Address,
    /// Payload
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct NodeEntry {
    name: String,
    public_key: Vec<u8>,
    announced: bool,
    fail_sends: bool,
    hold_links: bool,
    sinks: Vec<MeshEventSink>,
}

#[derive(Debug)]
struct LinkEntry {
    initiator: Address,
    responder: Address,
    quality: Option<LinkQuality>,
    established: bool,
}

impl LinkEntry {
    fn other_end(&self, from: &Address) -> Option<Address> {
        if *from == self.initiator {
            Some(self.responder)
        } else if *from == self.responder {
            Some(self.initiator)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct Hub {
    nodes: HashMap<Address, NodeEntry>,
    links: HashMap<LinkId, LinkEntry>,
    next_link: u64,
    sent: Vec<SentPacket>,
    route_requests: HashMap<Address, usize>,
}

impl Hub {
    fn emit(&mut self, to: &Address, event: MeshEvent) {
        if let Some(node) = self.nodes.get_mut(to) {
            trace!(node = %node.name, ?event, "Loopback event");
            node.sinks.retain(|sink| sink.send(event.clone()).is_ok());
        }
    }

    /// Report a pending link as established to both ends
    fn establish(&mut self, link: LinkId) -> bool {
        let Some(entry) = self.links.get_mut(&link) else {
            return false;
        };
        if entry.established {
            return false;
        }
        entry.established = true;
        let (initiator, responder) = (entry.initiator, entry.responder);

        self.emit(
            &initiator,
            MeshEvent::LinkEstablished {
                link,
                peer: Some(responder),
                initiator: true,
            },
        );
        self.emit(
            &responder,
            MeshEvent::LinkEstablished {
                link,
                peer: Some(initiator),
                initiator: false,
            },
        );
        true
    }

    fn close_link(&mut self, link: LinkId) -> bool {
        let Some(entry) = self.links.remove(&link) else {
            return false;
        };
        self.emit(&entry.initiator, MeshEvent::LinkClosed { link });
        self.emit(&entry.responder, MeshEvent::LinkClosed { link });
        true
    }
}

/// Shared in-process mesh hub
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a node named `name`, returning its facade
    ///
    /// The node's key material and address are derived from the name, so
    /// the same name always yields the same address.
    pub fn node(&self, name: &str) -> LoopbackMesh {
        let public_key = Sha256::digest(name.as_bytes()).to_vec();
        let address = Address::derive(&public_key);

        self.hub.lock().nodes.entry(address).or_insert_with(|| NodeEntry {
            name: name.to_string(),
            public_key,
            ..Default::default()
        });
        debug!(name, address = %address, "Loopback node joined");

        LoopbackMesh {
            network: self.clone(),
            address,
        }
    }

    /// Every send recorded so far
    pub fn sent(&self) -> Vec<SentPacket> {
        self.hub.lock().sent.clone()
    }

    /// Sends recorded on one link
    pub fn sent_on(&self, link: LinkId) -> Vec<SentPacket> {
        self.hub
            .lock()
            .sent
            .iter()
            .filter(|p| p.link == Some(link))
            .cloned()
            .collect()
    }

    /// Currently open links
    pub fn links(&self) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self.hub.lock().links.keys().copied().collect();
        links.sort();
        links
    }

    /// Make every send from `address` fail (or succeed again)
    pub fn set_fail_sends(&self, address: &Address, fail: bool) {
        if let Some(node) = self.hub.lock().nodes.get_mut(address) {
            node.fail_sends = fail;
        }
    }

    /// Set the phy-quality sample reported for a link
    pub fn set_link_quality(&self, link: LinkId, quality: LinkQuality) {
        if let Some(entry) = self.hub.lock().links.get_mut(&link) {
            entry.quality = Some(quality);
        }
    }

    /// Keep links opened by `address` pending until [`establish_link`] is called
    ///
    /// [`establish_link`]: LoopbackNetwork::establish_link
    pub fn set_hold_links(&self, address: &Address, hold: bool) {
        if let Some(node) = self.hub.lock().nodes.get_mut(address) {
            node.hold_links = hold;
        }
    }

    /// Complete a held link; false if it is unknown or already established
    pub fn establish_link(&self, link: LinkId) -> bool {
        self.hub.lock().establish(link)
    }

    /// Tear down a link from outside, as if the radio lost it
    pub fn close_link(&self, link: LinkId) -> bool {
        self.hub.lock().close_link(link)
    }

    /// Number of route requests issued for `address`
    pub fn route_requests(&self, address: &Address) -> usize {
        self.hub
            .lock()
            .route_requests
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Whether `address` has announced itself
    pub fn is_announced(&self, address: &Address) -> bool {
        self.hub
            .lock()
            .nodes
            .get(address)
            .map(|n| n.announced)
            .unwrap_or(false)
    }
}

/// One node's view of a [`LoopbackNetwork`]
#[derive(Debug, Clone)]
pub struct LoopbackMesh {
    network: LoopbackNetwork,
    address: Address,
}

impl LoopbackMesh {
    /// The network this node belongs to
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    /// Send a bare packet to `to`'s destination, outside any link
    pub fn send_packet(&self, to: &Address, data: &[u8]) -> Result<()> {
        let mut hub = self.network.hub.lock();
        if !hub.nodes.contains_key(to) {
            return Err(ChatError::Mesh(format!("Unknown destination {to}")));
        }
        let data = Bytes::copy_from_slice(data);
        hub.sent.push(SentPacket {
            link: None,
            from: self.address,
            to: *to,
            data: data.clone(),
        });
        hub.emit(to, MeshEvent::Packet { data });
        Ok(())
    }
}

#[async_trait]
impl MeshFacade for LoopbackMesh {
    fn own_address(&self) -> Address {
        self.address
    }

    async fn announce(&self) -> Result<()> {
        let mut hub = self.network.hub.lock();
        let node = hub
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| ChatError::Mesh("Node left the network".to_string()))?;
        node.announced = true;
        debug!(node = %node.name, "Loopback announce");
        Ok(())
    }

    async fn has_route(&self, address: &Address) -> bool {
        self.network.is_announced(address)
    }

    async fn request_route(&self, address: &Address) -> Result<()> {
        *self
            .network
            .hub
            .lock()
            .route_requests
            .entry(*address)
            .or_default() += 1;
        trace!(target_address = %address, "Loopback route request");
        Ok(())
    }

    async fn recall_identity(&self, address: &Address) -> Option<PeerIdentity> {
        let hub = self.network.hub.lock();
        hub.nodes
            .get(address)
            .filter(|n| n.announced)
            .map(|n| PeerIdentity::new(*address, n.public_key.clone()))
    }

    async fn open_link(&self, identity: &PeerIdentity) -> Result<LinkId> {
        let mut hub = self.network.hub.lock();
        let responder = identity.address();
        if !hub.nodes.contains_key(&responder) {
            return Err(ChatError::Mesh(format!("Unknown destination {responder}")));
        }

        hub.next_link += 1;
        let link = LinkId(hub.next_link);
        hub.links.insert(
            link,
            LinkEntry {
                initiator: self.address,
                responder,
                quality: None,
                established: false,
            },
        );

        let hold = hub
            .nodes
            .get(&self.address)
            .map(|n| n.hold_links)
            .unwrap_or(false);
        if hold {
            debug!(%link, "Loopback link held pending");
            return Ok(link);
        }

        hub.establish(link);
        debug!(%link, from = %self.address.short(), to = %responder.short(), "Loopback link open");
        Ok(link)
    }

    async fn send(&self, link: LinkId, data: &[u8]) -> Result<()> {
        let mut hub = self.network.hub.lock();
        if hub
            .nodes
            .get(&self.address)
            .map(|n| n.fail_sends)
            .unwrap_or(false)
        {
            return Err(ChatError::Mesh("Simulated send failure".to_string()));
        }

        let to = hub
            .links
            .get(&link)
            .and_then(|entry| entry.other_end(&self.address))
            .ok_or_else(|| ChatError::Mesh(format!("{link} is not open")))?;

        let data = Bytes::copy_from_slice(data);
        hub.sent.push(SentPacket {
            link: Some(link),
            from: self.address,
            to,
            data: data.clone(),
        });
        hub.emit(&to, MeshEvent::LinkPacket { link, data });
        Ok(())
    }

    async fn close_link(&self, link: LinkId) {
        self.network.hub.lock().close_link(link);
    }

    async fn link_quality(&self, link: LinkId) -> Option<LinkQuality> {
        self.network
            .hub
            .lock()
            .links
            .get(&link)
            .and_then(|entry| entry.quality)
    }

    fn subscribe(&self, sink: MeshEventSink) {
        if let Some(node) = self.network.hub.lock().nodes.get_mut(&self.address) {
            node.sinks.push(sink);
        }
    }
}
