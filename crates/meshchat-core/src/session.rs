//! Link session - lifecycle of the single current link
//!
//! The [`LinkSession`] actor is the only owner of the current link and its
//! state. Commands arrive from [`SessionHandle`]s with oneshot replies;
//! mesh events arrive on a second channel. Both are consumed by one task,
//! so connect/send and asynchronous link callbacks never race.
//!
//! ```text
//!            connect(hex)             route + identity
//!   Idle ─────────────────► Resolving ──────────────────► Connecting
//!    ▲                          │ timeout                     │ established
//!    └──────────────────────────┘                             ▼
//!                                     send failure / closed  Active
//!                          Closed ◄──────────────────────────┘
//! ```
//!
//! Resolution runs in a spawned task so events keep flowing while a peer is
//! being looked up. Each connect bumps a generation counter; a result from
//! an older generation is discarded.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::{Address, LinkId, LinkQuality, PeerIdentity};
use crate::config::SessionConfig;
use crate::error::{ChatError, Result};
use crate::mesh::{MeshEvent, MeshFacade};

/// Link session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No peer, no link
    Idle,
    /// Have a target address, awaiting route and identity
    Resolving,
    /// Link created, awaiting establishment
    Connecting,
    /// Link usable for send and receive
    Active,
    /// Link lost, peer retained for retry
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How an inbound message reached this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageVia {
    /// Over an established link
    Link,
    /// As a bare packet to this node's destination
    Packet,
}

impl fmt::Display for MessageVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageVia::Link => f.write_str("link"),
            MessageVia::Packet => f.write_str("packet"),
        }
    }
}

/// Events emitted by the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged {
        /// New state
        state: SessionState,
        /// Peer at the time of the change
        peer: Option<Address>,
        /// Current link at the time of the change
        link: Option<LinkId>,
    },

    /// A text message arrived
    Message {
        /// Decoded text (invalid UTF-8 replaced)
        text: String,
        /// Delivery path
        via: MessageVia,
        /// Link it arrived on, if any
        link: Option<LinkId>,
        /// Arrival time
        received_at: DateTime<Utc>,
    },
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Current state
    pub state: SessionState,
    /// Target or adopted peer
    pub peer: Option<Address>,
    /// Current link
    pub link: Option<LinkId>,
}

/// Commands sent to the session actor
#[derive(Debug)]
pub enum SessionCommand {
    /// Begin resolving and connecting to a peer given as hex
    Connect {
        /// Peer address as typed
        target: String,
        /// Resolves once a link is created or resolution fails
        reply: oneshot::Sender<Result<SessionState>>,
    },
    /// Send text over the active link
    Send {
        /// Message text
        text: String,
        /// Send outcome
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get a snapshot of the session
    Snapshot {
        /// Snapshot response
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Get the phy-quality sample of the current link
    LinkStats {
        /// Quality response; `Ok(None)` when no sample is available
        reply: oneshot::Sender<Result<Option<LinkQuality>>>,
    },
    /// Stop the actor
    Shutdown {
        /// Acknowledged after the actor has released its state
        reply: oneshot::Sender<()>,
    },
}

/// Handle for interacting with the session actor
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    own_address: Address,
}

impl SessionHandle {
    /// This node's own address
    pub fn own_address(&self) -> Address {
        self.own_address
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Resolve `peer_hex` and open a link to it
    ///
    /// Returns once the link has been created (state `Connecting`), or with
    /// `InvalidAddress`, `PeerUnreachable` or `ConnectSuperseded`.
    pub async fn connect(&self, peer_hex: &str) -> Result<SessionState> {
        let target = peer_hex.to_string();
        self.request(|reply| SessionCommand::Connect { target, reply })
            .await?
    }

    /// Send text over the active link
    pub async fn send(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|reply| SessionCommand::Send { text, reply })
            .await?
    }

    /// Current session snapshot
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Current session state
    pub async fn state(&self) -> Result<SessionState> {
        Ok(self.snapshot().await?.state)
    }

    /// Phy-quality sample of the current link
    pub async fn link_stats(&self) -> Result<Option<LinkQuality>> {
        self.request(|reply| SessionCommand::LinkStats { reply })
            .await?
    }

    /// Stop the session actor; calling again after it stopped is a no-op
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionCommand::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("own_address", &self.own_address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connect waiting on a resolution task
struct PendingConnect {
    generation: u64,
    address: Address,
    reply: oneshot::Sender<Result<SessionState>>,
    task: JoinHandle<()>,
}

/// Outcome of one resolution task
struct Resolved {
    generation: u64,
    outcome: Result<PeerIdentity>,
}

/// The link session actor
pub struct LinkSession {
    mesh: Arc<dyn MeshFacade>,
    config: SessionConfig,
    state: SessionState,
    peer: Option<Address>,
    link: Option<LinkId>,
    generation: u64,
    pending: Option<PendingConnect>,
    command_rx: mpsc::Receiver<SessionCommand>,
    mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
    resolve_tx: mpsc::UnboundedSender<Resolved>,
    resolve_rx: mpsc::UnboundedReceiver<Resolved>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl LinkSession {
    /// Create a session over `mesh` and subscribe to its events
    pub fn new(
        mesh: Arc<dyn MeshFacade>,
        config: SessionConfig,
    ) -> (Self, SessionHandle, broadcast::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, event_rx) = broadcast::channel(config.event_capacity.max(1));
        let (mesh_tx, mesh_rx) = mpsc::unbounded_channel();
        let (resolve_tx, resolve_rx) = mpsc::unbounded_channel();

        mesh.subscribe(mesh_tx);

        let handle = SessionHandle {
            command_tx,
            event_tx: event_tx.clone(),
            own_address: mesh.own_address(),
        };

        let session = Self {
            mesh,
            config,
            state: SessionState::Idle,
            peer: None,
            link: None,
            generation: 0,
            pending: None,
            command_rx,
            mesh_rx,
            resolve_tx,
            resolve_rx,
            event_tx,
        };

        (session, handle, event_rx)
    }

    /// Create a session and spawn its actor task
    pub fn spawn(
        mesh: Arc<dyn MeshFacade>,
        config: SessionConfig,
    ) -> (SessionHandle, broadcast::Receiver<SessionEvent>) {
        let (session, handle, events) = Self::new(mesh, config);
        tokio::spawn(session.run());
        (handle, events)
    }

    /// Run the actor until shut down or every handle is dropped
    pub async fn run(mut self) {
        info!(address = %self.mesh.own_address(), "Link session started");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                Some(event) = self.mesh_rx.recv() => {
                    self.handle_mesh_event(event);
                }

                Some(resolved) = self.resolve_rx.recv() => {
                    self.handle_resolved(resolved).await;
                }
            }
        }

        self.abandon_pending(|_| ChatError::SessionClosed);
        info!("Link session stopped");
    }

    /// Handle a command; returns false when the actor should stop
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Connect { target, reply } => {
                self.handle_connect(target, reply);
            }
            SessionCommand::Send { text, reply } => {
                let _ = reply.send(self.handle_send(&text).await);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::LinkStats { reply } => {
                let result = match self.link {
                    Some(link) => Ok(self.mesh.link_quality(link).await),
                    None => Err(self.not_active()),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Shutdown { reply } => {
                self.abandon_pending(|_| ChatError::SessionClosed);
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_connect(&mut self, target: String, reply: oneshot::Sender<Result<SessionState>>) {
        let address = match Address::parse(&target) {
            Ok(address) => address,
            Err(e) => {
                debug!(input = %target, "Rejected connect target");
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.abandon_pending(|address| ChatError::ConnectSuperseded {
            address: address.to_hex(),
        });
        if let Some(old) = self.link.take() {
            debug!(link = %old, "Superseding current link");
        }

        self.generation += 1;
        self.peer = Some(address);
        self.set_state(SessionState::Resolving);
        info!(peer = %address, "Resolving peer");

        let task = tokio::spawn(resolve_task(
            self.mesh.clone(),
            address,
            self.config.clone(),
            self.generation,
            self.resolve_tx.clone(),
        ));

        self.pending = Some(PendingConnect {
            generation: self.generation,
            address,
            reply,
            task,
        });
    }

    async fn handle_resolved(&mut self, resolved: Resolved) {
        if self.pending.as_ref().map(|p| p.generation) != Some(resolved.generation) {
            debug!(generation = resolved.generation, "Discarding stale resolution");
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        let result = match resolved.outcome {
            Ok(identity) => match self.mesh.open_link(&identity).await {
                Ok(link) => {
                    info!(peer = %pending.address, %link, "Link requested");
                    self.link = Some(link);
                    self.set_state(SessionState::Connecting);
                    Ok(SessionState::Connecting)
                }
                Err(e) => {
                    warn!(peer = %pending.address, error = %e, "Opening link failed");
                    self.peer = None;
                    self.set_state(SessionState::Idle);
                    Err(e)
                }
            },
            Err(e) => {
                warn!(peer = %pending.address, error = %e, "Peer resolution failed");
                self.peer = None;
                self.set_state(SessionState::Idle);
                Err(e)
            }
        };

        let _ = pending.reply.send(result);
    }

    fn handle_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::LinkEstablished {
                link,
                peer,
                initiator,
            } => {
                if self.link == Some(link) {
                    if self.state == SessionState::Connecting {
                        info!(%link, "Link established");
                        self.set_state(SessionState::Active);
                    }
                } else if initiator {
                    // Our own link from a connect that has since been replaced
                    debug!(%link, "Ignoring establishment of superseded link");
                } else if self.state != SessionState::Active {
                    self.abandon_pending(|address| ChatError::ConnectSuperseded {
                        address: address.to_hex(),
                    });
                    info!(%link, ?peer, "Adopting inbound link");
                    self.link = Some(link);
                    self.peer = peer.or(self.peer);
                    self.set_state(SessionState::Active);
                } else {
                    debug!(%link, "Ignoring link established while another link is active");
                }
            }

            MeshEvent::LinkClosed { link } => {
                if self.link == Some(link) {
                    info!(%link, "Link closed");
                    self.link = None;
                    self.set_state(SessionState::Closed);
                } else {
                    debug!(%link, "Ignoring close of non-current link");
                }
            }

            MeshEvent::LinkPacket { link, data } => {
                self.deliver(data, MessageVia::Link, Some(link));
            }

            MeshEvent::Packet { data } => {
                self.deliver(data, MessageVia::Packet, None);
            }
        }
    }

    async fn handle_send(&mut self, text: &str) -> Result<()> {
        let link = match (self.state, self.link) {
            (SessionState::Active, Some(link)) => link,
            _ => return Err(self.not_active()),
        };

        match self.mesh.send(link, text.as_bytes()).await {
            Ok(()) => {
                debug!(%link, size = text.len(), "Message sent");
                Ok(())
            }
            Err(e) => {
                warn!(%link, error = %e, "Link send failed, dropping link");
                self.link = None;
                self.set_state(SessionState::Closed);
                Err(ChatError::LinkSendFailure(e.to_string()))
            }
        }
    }

    fn deliver(&self, data: Bytes, via: MessageVia, link: Option<LinkId>) {
        let text = String::from_utf8_lossy(&data).into_owned();
        debug!(%via, size = data.len(), "Message received");
        let _ = self.event_tx.send(SessionEvent::Message {
            text,
            via,
            link,
            received_at: Utc::now(),
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Session state change");
        self.state = state;
        let _ = self.event_tx.send(SessionEvent::StateChanged {
            state,
            peer: self.peer,
            link: self.link,
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            peer: self.peer,
            link: self.link,
        }
    }

    fn not_active(&self) -> ChatError {
        ChatError::LinkNotActive {
            state: self.state.to_string(),
        }
    }

    /// Cancel an in-flight connect, telling its caller why
    fn abandon_pending(&mut self, reason: impl FnOnce(Address) -> ChatError) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
            debug!(peer = %pending.address, "Abandoning pending connect");
            let _ = pending.reply.send(Err(reason(pending.address)));
        }
    }
}

async fn resolve_task(
    mesh: Arc<dyn MeshFacade>,
    address: Address,
    config: SessionConfig,
    generation: u64,
    tx: mpsc::UnboundedSender<Resolved>,
) {
    let outcome = resolve_identity(mesh.as_ref(), &address, &config).await;
    let _ = tx.send(Resolved {
        generation,
        outcome,
    });
}

/// Poll for a route and an identity until both are known or time runs out
async fn resolve_identity(
    mesh: &dyn MeshFacade,
    address: &Address,
    config: &SessionConfig,
) -> Result<PeerIdentity> {
    let started = Instant::now();
    let deadline = started + config.resolve_timeout;
    let mut next_request = started;

    loop {
        let now = Instant::now();
        if !mesh.has_route(address).await && now >= next_request {
            if let Err(e) = mesh.request_route(address).await {
                debug!(peer = %address, error = %e, "Route request failed");
            }
            next_request = now + config.path_request_interval;
        }

        if mesh.has_route(address).await {
            if let Some(identity) = mesh.recall_identity(address).await {
                debug!(peer = %address, elapsed = ?started.elapsed(), "Peer resolved");
                return Ok(identity);
            }
        }

        if Instant::now() >= deadline {
            return Err(ChatError::PeerUnreachable {
                address: address.to_hex(),
                waited_ms: config.resolve_timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use std::time::Duration;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Active.to_string(), "active");
        assert_eq!(
            serde_json::to_string(&SessionState::Connecting).unwrap(),
            "\"connecting\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_identity_times_out() {
        let network = LoopbackNetwork::new();
        let a = network.node("alice");
        let target = Address::derive(b"nobody");
        let config = SessionConfig::default();

        let started = Instant::now();
        let err = resolve_identity(&a, &target, &config).await.unwrap_err();
        assert!(matches!(err, ChatError::PeerUnreachable { .. }));
        assert!(started.elapsed() >= config.resolve_timeout);
        assert!(started.elapsed() < config.resolve_timeout + Duration::from_millis(200));

        // One request up front, then one per path_request_interval
        let requests = network.route_requests(&target);
        assert!((5..=6).contains(&requests), "got {requests} route requests");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_identity_succeeds_once_announced() {
        let network = LoopbackNetwork::new();
        let a = network.node("alice");
        let b = network.node("bob");
        let b_addr = b.own_address();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            b.announce().await.unwrap();
        });

        let identity = resolve_identity(&a, &b_addr, &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(identity.address(), b_addr);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_after_shutdown() {
        let network = LoopbackNetwork::new();
        let (handle, _events) =
            LinkSession::spawn(Arc::new(network.node("alice")), SessionConfig::default());

        handle.shutdown().await;
        handle.shutdown().await;
        assert!(matches!(handle.state().await, Err(ChatError::SessionClosed)));
    }
}
