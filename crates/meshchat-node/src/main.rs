//! meshchat node - terminal chat over a link-oriented mesh
//!
//! Runs a chat node on the in-process loopback mesh with:
//! - console input on stdin and output on stdout
//! - an optional companion display on a serial port (`serial` feature)
//! - an optional echo peer to chat with

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshchat_bridge::BridgeConfig;
use meshchat_core::{
    ChatConfig, ChatNode, LinkSession, LoopbackNetwork, MeshFacade, SessionEvent,
};

#[derive(Parser, Debug)]
#[command(name = "meshchat-node")]
#[command(about = "Peer-to-peer text chat over a link-oriented mesh")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial port of the companion display (e.g. /dev/ttyUSB0)
    #[arg(long, short)]
    serial: Option<PathBuf>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Announce presence on startup
    #[arg(long, short)]
    announce: bool,

    /// Peer address (hex) to connect to on startup
    #[arg(long, short)]
    peer: Option<String>,

    /// Node name, seeds this node's identity on the loopback mesh
    #[arg(long, short)]
    name: Option<String>,

    /// Start an echo peer on the loopback mesh
    #[arg(long)]
    echo_peer: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they never interleave with chat output
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&args)?;
    info!("Starting meshchat node: {}", config.node_name);

    let network = LoopbackNetwork::new();
    if args.echo_peer {
        spawn_echo_peer(&network).await?;
    }

    let mesh = Arc::new(network.node(&config.node_name));
    let bridge = config.bridge.clone();
    let mut node = ChatNode::new(config, mesh);
    if let Some(bridge) = bridge {
        attach_serial(&mut node, &bridge);
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    node.run(stdin, tokio::io::stdout()).await?;

    Ok(())
}

/// Build the node configuration from the config file and CLI flags
///
/// Flags override file values.
fn load_config(args: &Args) -> anyhow::Result<ChatConfig> {
    let mut config = match &args.config {
        Some(path) => ChatConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ChatConfig::default(),
    };

    if let Some(name) = &args.name {
        config.node_name = name.clone();
    }
    if args.announce {
        config.announce_on_start = true;
    }
    if let Some(peer) = &args.peer {
        config.peer = Some(peer.clone());
    }

    if args.serial.is_some() || args.baud.is_some() {
        let bridge = config.bridge.get_or_insert_with(BridgeConfig::default);
        if let Some(port) = &args.serial {
            bridge.serial.port = port.clone();
        }
        if let Some(baud) = args.baud {
            bridge.serial.baud_rate = baud;
        }
    }

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "serial")]
fn attach_serial(node: &mut ChatNode, bridge: &BridgeConfig) {
    use meshchat_bridge::SerialPortTransport;

    info!(
        port = %bridge.serial.port.display(),
        baud = bridge.serial.baud_rate,
        "Attaching companion display"
    );
    let transport =
        SerialPortTransport::new(&bridge.serial.port).with_baud_rate(bridge.serial.baud_rate);
    node.attach_peripheral(transport);
}

#[cfg(not(feature = "serial"))]
fn attach_serial(_node: &mut ChatNode, bridge: &BridgeConfig) {
    warn!(
        port = %bridge.serial.port.display(),
        "Built without the `serial` feature, companion display disabled"
    );
}

/// Start a peer named "echo" that answers every message it receives
async fn spawn_echo_peer(network: &LoopbackNetwork) -> anyhow::Result<()> {
    let mesh = network.node("echo");
    mesh.announce().await?;
    let address = mesh.own_address();
    let (session, mut events) = LinkSession::spawn(Arc::new(mesh), Default::default());

    info!("Echo peer listening at {}", address);

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::Message { text, .. } = event {
                if let Err(e) = session.send(&format!("echo: {text}")).await {
                    error!("Echo reply failed: {}", e);
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("meshchat-node").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = load_config(&parse(&[])).unwrap();
        assert_eq!(config.node_name, meshchat_core::config::DEFAULT_NODE_NAME);
        assert!(!config.announce_on_start);
        assert!(config.peer.is_none());
        assert!(config.bridge.is_none());
    }

    #[test]
    fn test_flags_overlay() {
        let args = parse(&[
            "--name",
            "alice",
            "--announce",
            "--peer",
            "0123456789abcdef0123456789abcdef",
            "--serial",
            "/dev/ttyACM0",
            "--baud",
            "9600",
        ]);
        let config = load_config(&args).unwrap();

        assert_eq!(config.node_name, "alice");
        assert!(config.announce_on_start);
        assert_eq!(
            config.peer.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.serial.port, PathBuf::from("/dev/ttyACM0"));
        assert_eq!(bridge.serial.baud_rate, 9600);
    }

    #[test]
    fn test_baud_alone_enables_bridge_with_default_port() {
        let config = load_config(&parse(&["--baud", "57600"])).unwrap();
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.serial.port, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(bridge.serial.baud_rate, 57600);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(load_config(&parse(&["--name", "  "])).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_config(&parse(&["--config", "/nonexistent/meshchat.json"])).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/meshchat.json"));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Args::try_parse_from(["meshchat-node", "--bogus"]).is_err());
    }

    #[tokio::test]
    async fn test_echo_peer_answers() {
        let network = LoopbackNetwork::new();
        spawn_echo_peer(&network).await.unwrap();

        let alice = network.node("alice");
        let (session, mut events) = LinkSession::spawn(Arc::new(alice), Default::default());
        let echo = network.node("echo").own_address();
        session.connect(&echo.to_hex()).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SessionEvent::StateChanged { state, .. }) = events.recv().await {
                    if state == meshchat_core::SessionState::Active {
                        break;
                    }
                }
            }
            session.send("ping").await.unwrap();
            loop {
                if let Ok(SessionEvent::Message { text, .. }) = events.recv().await {
                    return text;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reply, "echo: ping");
    }
}
