//! Chat node - composition root
//!
//! Wires the console, the optional peripheral bridge, the command router
//! and the link session together and owns their lifecycle.
//!
//! ```text
//!  console lines ──► dispatcher ─┐                 ┌──► console writer
//!                                ├─► CommandRouter │
//!  peripheral lines ► dispatcher ┘        │        └──► bridge (TXTP/JCTL)
//!                                         ▼                 ▲
//!                                    LinkSession ── events ─┘
//! ```
//!
//! Each surface has its own dispatcher task that handles its lines in
//! order, so a slow `:connect` on one surface never blocks the other.
//! `:quit` skips the dispatcher and reaches the main loop directly.
//! Replies go back to the surface that issued the line; session events are
//! shown on the console and mirrored to the peripheral.

use meshchat_bridge::{
    BridgeConfig, BridgeHandle, BridgeStats, Inbound, InboundCallback, SerialBridge,
    SerialTransport,
};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandRouter, Reply, Surface, HELP_LINES};
use crate::config::ChatConfig;
use crate::error::Result;
use crate::mesh::MeshFacade;
use crate::session::{LinkSession, MessageVia, SessionEvent, SessionHandle, SessionState};

/// Banner printed on startup
pub const BANNER: &str = "meshchat";

/// Input reaching the node's main loop
#[derive(Debug)]
enum NodeInput {
    /// A dispatcher finished a line
    Reply { surface: Surface, reply: Reply },
    /// The console reached end of input
    ConsoleClosed,
}

/// Peripheral attachment
struct Peripheral {
    bridge: SerialBridge,
    handle: BridgeHandle,
    lines: Option<mpsc::UnboundedReceiver<String>>,
}

/// The chat node
pub struct ChatNode {
    config: ChatConfig,
    mesh: Arc<dyn MeshFacade>,
    session: SessionHandle,
    events: broadcast::Receiver<SessionEvent>,
    router: CommandRouter,
    peripheral: Option<Peripheral>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatNode {
    /// Create a node over `mesh` and start its link session
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ChatConfig, mesh: Arc<dyn MeshFacade>) -> Self {
        let (session, events) = LinkSession::spawn(mesh.clone(), config.session.clone());
        let router = CommandRouter::new(session.clone(), mesh.clone());

        Self {
            config,
            mesh,
            session,
            events,
            router,
            peripheral: None,
            tasks: Vec::new(),
        }
    }

    /// Attach a companion display over `transport`
    ///
    /// Uses the configured bridge settings, or defaults if none are set.
    pub fn attach_peripheral<T>(&mut self, transport: T)
    where
        T: SerialTransport + 'static,
    {
        let bridge_config = self.config.bridge.clone().unwrap_or_else(BridgeConfig::default);
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        let callback: InboundCallback = Arc::new(move |msg: Inbound| {
            match peripheral_line(msg)? {
                Some(line) => line_tx
                    .send(line)
                    .map_err(|_| "node is shutting down".to_string()),
                None => Ok(()),
            }
        });

        let bridge = SerialBridge::start(transport, &bridge_config, callback);
        let handle = bridge.handle();
        self.peripheral = Some(Peripheral {
            bridge,
            handle,
            lines: Some(line_rx),
        });
    }

    /// Handle to the link session
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Bridge counters, if a peripheral is attached
    pub fn bridge_stats(&self) -> Option<BridgeStats> {
        self.peripheral.as_ref().map(|p| p.handle.stats())
    }

    /// Handle to the peripheral bridge, if attached
    pub fn bridge_handle(&self) -> Option<BridgeHandle> {
        self.peripheral.as_ref().map(|p| p.handle.clone())
    }

    /// Run until `:quit` or console end of input, then shut down
    pub async fn run<R, W>(mut self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let result = self.event_loop(input, &mut output).await;
        self.shutdown().await;
        output.flush().await?;
        result
    }

    async fn event_loop<R, W>(&mut self, input: R, output: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let own = self.mesh.own_address();
        write_lines(output, &[BANNER.to_string(), format!("Your address: {own}")]).await?;
        write_lines(output, HELP_LINES).await?;
        self.to_peripheral(&format!("Your address: {own}"));
        self.control_to_peripheral(json!({ "event": "address", "address": own.to_hex() }));

        if self.config.announce_on_start {
            let reply = self.router.execute(Command::Announce, Surface::Console).await;
            write_lines(output, reply.lines()).await?;
        }

        let (input_tx, mut input_rx) = mpsc::unbounded_channel();
        self.spawn_console(input, input_tx.clone());
        self.spawn_peripheral(input_tx.clone());

        if let Some(peer) = self.config.peer.clone() {
            let router = self.router.clone();
            let tx = input_tx.clone();
            self.tasks.push(tokio::spawn(async move {
                let reply = router.execute(Command::Connect(peer), Surface::Console).await;
                let _ = tx.send(NodeInput::Reply {
                    surface: Surface::Console,
                    reply,
                });
            }));
        }
        drop(input_tx);

        info!(address = %own, "Chat node running");

        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(NodeInput::Reply { reply: Reply::Quit, surface }) => {
                            debug!(%surface, "Quit");
                            break;
                        }
                        Some(NodeInput::Reply { reply: Reply::Lines(lines), surface }) => {
                            self.show(surface, &lines, output).await?;
                        }
                        Some(NodeInput::ConsoleClosed) | None => {
                            debug!("Console input closed");
                            break;
                        }
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Ok(event) => self.render_event(event, output).await?,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Session events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Session stopped unexpectedly");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn spawn_console<R>(&mut self, input: R, tx: mpsc::UnboundedSender<NodeInput>)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let dispatcher = self.spawn_dispatcher(Surface::Console, tx.clone());
        self.tasks.push(tokio::spawn(async move {
            let mut lines = input.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if !forward_line(line, Surface::Console, &dispatcher, &tx) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Console read failed");
                        break;
                    }
                }
            }
            // The dispatcher reports ConsoleClosed once queued lines are done
        }));
    }

    fn spawn_peripheral(&mut self, tx: mpsc::UnboundedSender<NodeInput>) {
        let Some(mut lines) = self.peripheral.as_mut().and_then(|p| p.lines.take()) else {
            return;
        };
        let dispatcher = self.spawn_dispatcher(Surface::Peripheral, tx.clone());
        self.tasks.push(tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                debug!(%line, "Peripheral input");
                if !forward_line(line, Surface::Peripheral, &dispatcher, &tx) {
                    return;
                }
            }
        }));
    }

    /// Start the task that runs one surface's lines through the router in order
    fn spawn_dispatcher(
        &mut self,
        surface: Surface,
        tx: mpsc::UnboundedSender<NodeInput>,
    ) -> mpsc::UnboundedSender<String> {
        let router = self.router.clone();
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        self.tasks.push(tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                let reply = router.dispatch(&line, surface).await;
                if tx.send(NodeInput::Reply { surface, reply }).is_err() {
                    return;
                }
            }
            if surface == Surface::Console {
                let _ = tx.send(NodeInput::ConsoleClosed);
            }
        }));
        line_tx
    }

    async fn show<W>(&self, surface: Surface, lines: &[String], output: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match surface {
            Surface::Console => write_lines(output, lines).await,
            Surface::Peripheral => {
                for line in lines {
                    self.to_peripheral(line);
                }
                Ok(())
            }
        }
    }

    async fn render_event<W>(&self, event: SessionEvent, output: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match event {
            SessionEvent::StateChanged { state, peer, .. } => {
                self.control_to_peripheral(json!({
                    "event": "link",
                    "state": state,
                    "peer": peer.map(|p| p.to_hex()),
                }));

                let line = match state {
                    SessionState::Resolving => peer.map(|p| format!("[i] Resolving {p}…")),
                    SessionState::Active => Some("[✓] Link established".to_string()),
                    SessionState::Closed => Some("[i] Link closed".to_string()),
                    SessionState::Idle | SessionState::Connecting => None,
                };
                if let Some(line) = line {
                    self.to_peripheral(&line);
                    write_lines(output, &[line]).await?;
                }
            }

            SessionEvent::Message { text, via, .. } => {
                let line = match via {
                    MessageVia::Link => format!("[← link] {text}"),
                    MessageVia::Packet => format!("[←] {text}"),
                };
                self.to_peripheral(&line);
                self.control_to_peripheral(json!({
                    "event": "message",
                    "text": text,
                    "via": via,
                }));
                write_lines(output, &[line]).await?;
            }
        }
        Ok(())
    }

    fn to_peripheral(&self, line: &str) {
        if let Some(peripheral) = &self.peripheral {
            if let Err(e) = peripheral.handle.send_text(line) {
                debug!(error = %e, "Peripheral text not queued");
            }
        }
    }

    fn control_to_peripheral(&self, value: serde_json::Value) {
        if let Some(peripheral) = &self.peripheral {
            if let Err(e) = peripheral.handle.send_control(&value) {
                debug!(error = %e, "Peripheral control not queued");
            }
        }
    }

    /// Stop dispatchers, the session and the bridge; safe to repeat
    async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.session.shutdown().await;
        if let Some(peripheral) = &self.peripheral {
            peripheral.bridge.close().await;
        }
        info!("Chat node stopped");
    }
}

/// Queue a line for its surface's dispatcher
///
/// `:quit` bypasses the queue so it takes effect even while an earlier
/// line (a `:connect` still resolving) is in progress. Returns false once
/// the surface should stop reading.
fn forward_line(
    line: String,
    surface: Surface,
    dispatcher: &mpsc::UnboundedSender<String>,
    tx: &mpsc::UnboundedSender<NodeInput>,
) -> bool {
    if matches!(Command::parse(&line), Ok(Command::Quit)) {
        info!(%surface, "Quit requested");
        let _ = tx.send(NodeInput::Reply {
            surface,
            reply: Reply::Quit,
        });
        return false;
    }
    dispatcher.send(line).is_ok()
}

/// Convert a peripheral message into an input line
///
/// `TXIN` text is used as is. `EVNT` JSON objects contribute their `text`
/// or `command` string field; objects with neither are ignored. Malformed
/// JSON is an error.
pub fn peripheral_line(msg: Inbound) -> std::result::Result<Option<String>, String> {
    match msg {
        Inbound::Text(text) => Ok(Some(text)),
        Inbound::Event(json) => {
            let value: serde_json::Value = serde_json::from_str(&json)
                .map_err(|e| format!("Malformed event payload: {e}"))?;
            let field = ["text", "command"]
                .iter()
                .find_map(|key| value.get(key).and_then(|v| v.as_str()));
            match field {
                Some(line) => Ok(Some(line.to_string())),
                None => {
                    debug!(event = %json, "Ignoring peripheral event");
                    Ok(None)
                }
            }
        }
    }
}

async fn write_lines<W, S>(output: &mut W, lines: &[S]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    for line in lines {
        output.write_all(line.as_ref().as_bytes()).await?;
        output.write_all(b"\n").await?;
    }
    output.flush().await?;
    Ok(())
}
