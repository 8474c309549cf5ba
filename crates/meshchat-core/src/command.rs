//! Command parsing and dispatch
//!
//! The same command set is accepted from the console and from the
//! peripheral. Lines starting with `:` are commands; anything else is a
//! message for the active link.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ChatError, Result};
use crate::mesh::MeshFacade;
use crate::session::SessionHandle;

/// Usage line for `:connect`
pub const CONNECT_USAGE: &str = ":connect <peer_hex>";

/// Help text listing the command set
pub const HELP_LINES: &[&str] = &[
    "Type messages and press Enter.",
    "Commands:",
    "  :me                  -> show my address",
    "  :announce            -> broadcast my presence",
    "  :connect <peer_hex>  -> set peer and open link",
    "  :rssi                -> show link quality",
    "  :help                -> show this help",
    "  :quit                -> exit",
];

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Empty line
    Noop,
    /// `:help`
    Help,
    /// `:announce`
    Announce,
    /// `:connect <hex>`
    Connect(String),
    /// `:me`
    ShowAddress,
    /// `:rssi`
    ShowLinkStats,
    /// `:quit`
    Quit,
    /// Message text for the active link
    Plain(String),
}

impl Command {
    /// Parse one input line
    ///
    /// Verbs are case-sensitive. Unknown verbs and `:connect` without an
    /// address are rejected with [`ChatError::InvalidCommand`].
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Command::Noop);
        }
        if !line.starts_with(':') {
            return Ok(Command::Plain(line.to_string()));
        }

        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, Some(rest.trim_start())),
            None => (line, None),
        };

        match (verb, arg) {
            (":me", _) => Ok(Command::ShowAddress),
            (":announce", _) => Ok(Command::Announce),
            (":rssi", _) => Ok(Command::ShowLinkStats),
            (":help", _) => Ok(Command::Help),
            (":quit", _) => Ok(Command::Quit),
            (":connect", Some(peer)) => Ok(Command::Connect(peer.to_string())),
            (":connect", None) => Err(ChatError::InvalidCommand {
                verb: verb.to_string(),
                reason: format!("missing peer address, usage: {CONNECT_USAGE}"),
            }),
            _ => Err(ChatError::InvalidCommand {
                verb: verb.to_string(),
                reason: "unknown command, try :help".to_string(),
            }),
        }
    }
}

/// Where an input line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    /// Local terminal
    Console,
    /// Companion display over the serial bridge
    Peripheral,
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Surface::Console => f.write_str("console"),
            Surface::Peripheral => f.write_str("peripheral"),
        }
    }
}

/// Result of dispatching a line, addressed to the originating surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Lines to show (possibly none)
    Lines(Vec<String>),
    /// The user asked to exit
    Quit,
}

impl Reply {
    fn line(text: impl Into<String>) -> Self {
        Reply::Lines(vec![text.into()])
    }

    fn error(err: &ChatError) -> Self {
        match err {
            ChatError::LinkNotActive { .. } => Reply::line(format!(
                "[!] {err}. Use {CONNECT_USAGE} first."
            )),
            _ => Reply::line(format!("[!] {err}")),
        }
    }

    /// Lines to show, empty for `Quit`
    pub fn lines(&self) -> &[String] {
        match self {
            Reply::Lines(lines) => lines,
            Reply::Quit => &[],
        }
    }
}

/// Dispatches parsed lines to the session and the mesh
#[derive(Clone)]
pub struct CommandRouter {
    session: SessionHandle,
    mesh: Arc<dyn MeshFacade>,
}

impl CommandRouter {
    /// Create a router over a session and the mesh it runs on
    pub fn new(session: SessionHandle, mesh: Arc<dyn MeshFacade>) -> Self {
        Self { session, mesh }
    }

    /// Parse and execute one line from `surface`
    pub async fn dispatch(&self, line: &str, surface: Surface) -> Reply {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!(%surface, error = %e, "Rejected input line");
                return Reply::error(&e);
            }
        };
        self.execute(command, surface).await
    }

    /// Execute an already parsed command
    pub async fn execute(&self, command: Command, surface: Surface) -> Reply {
        match command {
            Command::Noop => Reply::Lines(Vec::new()),

            Command::Help => Reply::Lines(HELP_LINES.iter().map(|s| s.to_string()).collect()),

            Command::ShowAddress => Reply::line(format!("[you] {}", self.mesh.own_address())),

            Command::Announce => match self.mesh.announce().await {
                Ok(()) => {
                    info!(%surface, "Announce sent");
                    Reply::line("[→] Announce sent")
                }
                Err(e) => Reply::error(&e),
            },

            Command::Connect(peer) => match self.session.connect(&peer).await {
                Ok(_) => Reply::line("[i] Attempting to establish link…"),
                Err(e) => Reply::error(&e),
            },

            Command::ShowLinkStats => match self.session.link_stats().await {
                Ok(Some(quality)) if quality.is_available() => {
                    Reply::line(format!("[i] {quality}"))
                }
                Ok(_) => Reply::line("[i] Link quality unavailable"),
                Err(e) => Reply::error(&e),
            },

            Command::Quit => {
                info!(%surface, "Quit requested");
                Reply::Quit
            }

            Command::Plain(text) => match self.session.send(&text).await {
                Ok(()) => Reply::Lines(Vec::new()),
                Err(e) => Reply::error(&e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(":connect abc123").unwrap(),
            Command::Connect("abc123".to_string())
        );
        assert_eq!(
            Command::parse("hello world").unwrap(),
            Command::Plain("hello world".to_string())
        );
        assert_eq!(Command::parse("").unwrap(), Command::Noop);
        assert_eq!(Command::parse("   \t").unwrap(), Command::Noop);
        assert_eq!(Command::parse(":me").unwrap(), Command::ShowAddress);
        assert_eq!(Command::parse(":announce").unwrap(), Command::Announce);
        assert_eq!(Command::parse(":rssi").unwrap(), Command::ShowLinkStats);
        assert_eq!(Command::parse(" :quit ").unwrap(), Command::Quit);
        assert_eq!(Command::parse(":help").unwrap(), Command::Help);
    }

    #[test]
    fn test_parse_invalid_commands() {
        assert!(matches!(
            Command::parse(":bogus"),
            Err(ChatError::InvalidCommand { verb, .. }) if verb == ":bogus"
        ));
        assert!(matches!(
            Command::parse(":connect"),
            Err(ChatError::InvalidCommand { reason, .. }) if reason.contains(CONNECT_USAGE)
        ));
        // Verbs are case-sensitive
        assert!(Command::parse(":ME").is_err());
    }

    #[test]
    fn test_parse_whitespace_handling() {
        assert_eq!(
            Command::parse(":connect \t  abc123  ").unwrap(),
            Command::Connect("abc123".to_string())
        );
        assert_eq!(
            Command::parse("  spaced  out  ").unwrap(),
            Command::Plain("spaced  out".to_string())
        );
    }

    #[test]
    fn test_error_reply_hint() {
        let reply = Reply::error(&ChatError::LinkNotActive {
            state: "idle".to_string(),
        });
        assert_eq!(
            reply.lines(),
            ["[!] No active link (state: idle). Use :connect <peer_hex> first."]
        );
    }
}
