//! Command-Line Client
//!
//! `sshdeck list` prints the server's connection profiles. `sshdeck shell`
//! opens the event channel and runs a line REPL over any number of sessions;
//! plain lines go to the focused session, `:` lines are client commands.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::channel::{ChannelSignal, EventChannel, WebSocketTransport};
use crate::config::ClientConfig;
use crate::orchestrator::ChannelOrchestrator;
use crate::profiles::{ProfileClient, ProfileError};
use crate::protocol::{ConnectionId, LogKind, ProfileRef};
use crate::session::{Input, Intent, LogLine, SessionEvent, SessionManager, SessionRegistry};

#[derive(Debug, Parser)]
#[command(name = "sshdeck", version, about = "Multiplexed remote shells")]
pub struct Cli {
    /// Client config file (default: <config_dir>/sshdeck/client.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Event channel URL, e.g. ws://127.0.0.1:5000/ws
    #[arg(long, global = true)]
    server: Option<String>,

    /// Bearer token
    #[arg(long, global = true, env = "SSHDECK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List connection profiles
    List,
    /// Open sessions and attach a REPL
    Shell {
        /// Profiles to connect right away; the first one is focused
        ids: Vec<ConnectionId>,
    },
}

/// Parse arguments and run the client
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    crate::init_logging(&cli.log_level);

    let mut config = ClientConfig::load(cli.config.as_deref()).context("Failed to load client config")?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if cli.token.is_some() {
        config.token = cli.token;
    }

    match cli.command {
        CliCommand::List => list(&config).await,
        CliCommand::Shell { ids } => shell(config, ids).await,
    }
}

async fn list(config: &ClientConfig) -> anyhow::Result<()> {
    let client = ProfileClient::new(config.api_base()?, config.token.clone())?;
    let profiles = client.list().await.context("Failed to fetch connection profiles")?;

    if profiles.is_empty() {
        println!("No connection profiles");
    }
    for profile in &profiles {
        println!("{}", format_profile(profile));
    }
    Ok(())
}

async fn shell(config: ClientConfig, ids: Vec<ConnectionId>) -> anyhow::Result<()> {
    let profile_client = match ProfileClient::new(config.api_base()?, config.token.clone()) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Could not create profile client: {}", e);
            None
        }
    };
    let mut profiles: HashMap<ConnectionId, ProfileRef> = match &profile_client {
        Some(client) => match client.list().await {
            Ok(list) => list.into_iter().map(|p| (p.id.clone(), p)).collect(),
            Err(e) => {
                warn!("Could not fetch connection profiles: {}", e);
                HashMap::new()
            }
        },
        None => HashMap::new(),
    };

    let (input_tx, input_rx) = mpsc::unbounded_channel::<Input>();
    let orchestrator = Arc::new(ChannelOrchestrator::new(open_channel(&config, &input_tx).await?));

    let registry = Arc::new(SessionRegistry::with_limits(config.max_sessions));
    let manager = SessionManager::new(registry.clone(), orchestrator.clone())
        .with_stuck_threshold(Duration::from_secs(config.stuck_after_secs));
    let focus: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));

    tokio::spawn(render(registry.subscribe(), focus.clone()));
    tokio::spawn(manager.run(input_rx));

    for id in ids {
        let profile = resolve_profile(profile_client.as_ref(), &mut profiles, &id).await;
        connect(&input_tx, &focus, id, profile)?;
    }
    println!("Type :help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::Invalid(message) => println!("{}", message),
            ReplCommand::Send(text) => match focus.lock().clone() {
                Some(id) => input_tx.send(Intent::Command { id, text }.into())?,
                None => println!("No focused session, use :focus <id> or :connect <id>"),
            },
            ReplCommand::Connect(id) => {
                let profile = resolve_profile(profile_client.as_ref(), &mut profiles, &id).await;
                connect(&input_tx, &focus, id, profile)?;
            }
            ReplCommand::Focus(id) => match registry.get(&id) {
                Some(info) => {
                    println!("Focused {} ({}, {})", id, info.name, info.status);
                    *focus.lock() = Some(id);
                }
                None => println!("No session {}", id),
            },
            ReplCommand::Disconnect(id) => match id.or_else(|| focus.lock().clone()) {
                Some(id) => input_tx.send(Intent::Disconnect { id }.into())?,
                None => println!("No focused session"),
            },
            ReplCommand::Sessions => {
                let sessions = registry.list_sessions();
                if sessions.is_empty() {
                    println!("No sessions");
                }
                let focused = focus.lock().clone();
                for info in sessions {
                    let marker = if focused.as_ref() == Some(&info.id) { "*" } else { " " };
                    println!(
                        "{} {:>6}  {:<20} {:<12} {} ({} lines)",
                        marker,
                        info.id,
                        info.name,
                        info.status.to_string(),
                        info.target.unwrap_or_default(),
                        info.line_count
                    );
                }
            }
            ReplCommand::History(id) => match id.or_else(|| focus.lock().clone()) {
                Some(id) => match registry.command_history(&id) {
                    Some(commands) if commands.is_empty() => println!("No commands sent on {}", id),
                    Some(commands) => {
                        for (n, command) in commands.iter().enumerate() {
                            println!("{:>4}  {}", n + 1, command);
                        }
                    }
                    None => println!("No session {}", id),
                },
                None => println!("No focused session"),
            },
            ReplCommand::Export(id, path) => match registry.export_log(&id) {
                Some(text) => {
                    tokio::fs::write(&path, text)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Exported {} to {}", id, path.display());
                }
                None => println!("No session {}", id),
            },
            ReplCommand::Close(id) => input_tx.send(Intent::Close { id }.into())?,
            ReplCommand::Prune => input_tx.send(Intent::Prune.into())?,
            ReplCommand::Reconnect => {
                if orchestrator.is_connected() {
                    println!("Event channel is open");
                    continue;
                }
                match open_channel(&config, &input_tx).await {
                    Ok(channel) => {
                        orchestrator.replace_channel(channel);
                        println!("Reconnected to {}, use :connect to reopen sessions", config.server_url);
                    }
                    Err(e) => println!("Reconnect failed: {:#}", e),
                }
            }
            ReplCommand::Logout => {
                input_tx.send(Intent::Logout.into())?;
                *focus.lock() = None;
            }
            ReplCommand::Quit => break,
        }
    }

    input_tx.send(Intent::Logout.into())?;
    // let the pump flush disconnect frames
    tokio::time::sleep(Duration::from_millis(250)).await;
    info!("Client exiting");
    Ok(())
}

/// Open the event channel; its signals feed the dispatch loop
async fn open_channel(
    config: &ClientConfig,
    input_tx: &mpsc::UnboundedSender<Input>,
) -> anyhow::Result<EventChannel> {
    let transport = WebSocketTransport::connect(&config.server_url, config.token.as_deref())
        .await
        .with_context(|| format!("Failed to open event channel to {}", config.server_url))?;

    let signal_tx = input_tx.clone();
    let (channel, _pump) = EventChannel::open(Box::new(transport), move |signal| {
        let lost = match &signal {
            ChannelSignal::Closed { reason } => Some(reason.clone()),
            ChannelSignal::Frame(_) => None,
        };
        let _ = signal_tx.send(signal.into());
        if let Some(reason) = lost {
            println!("-- event channel lost ({}), use :reconnect", reason);
        }
    });
    Ok(channel)
}

/// Cached profile for `id`, asking the server again for ids added since startup
async fn resolve_profile(
    client: Option<&ProfileClient>,
    profiles: &mut HashMap<ConnectionId, ProfileRef>,
    id: &ConnectionId,
) -> Option<ProfileRef> {
    if let Some(profile) = profiles.get(id) {
        return Some(profile.clone());
    }

    match client?.get(id).await {
        Ok(profile) => {
            profiles.insert(id.clone(), profile.clone());
            Some(profile)
        }
        Err(ProfileError::NotFound(_)) => {
            println!("Warning: {} is not a known profile", id);
            None
        }
        Err(e) => {
            warn!("Could not look up profile {}: {}", id, e);
            None
        }
    }
}

fn connect(
    input_tx: &mpsc::UnboundedSender<Input>,
    focus: &Mutex<Option<ConnectionId>>,
    id: ConnectionId,
    profile: Option<ProfileRef>,
) -> anyhow::Result<()> {
    let mut focused = focus.lock();
    if focused.is_none() {
        *focused = Some(id.clone());
    }

    if input_tx.send(Intent::Connect { id, profile }.into()).is_err() {
        bail!("Session dispatch loop stopped");
    }
    Ok(())
}

async fn render(events: broadcast::Receiver<SessionEvent>, focus: Arc<Mutex<Option<ConnectionId>>>) {
    let mut events = BroadcastStream::new(events);
    while let Some(event) = events.next().await {
        if let Ok(event) = &event {
            debug!("Rendering {}", event.event_name());
        }
        match event {
            Ok(SessionEvent::LineAppended { session_id, line }) => {
                println!("{}", format_line(&session_id, &line));
            }
            Ok(SessionEvent::StatusChanged {
                session_id,
                new_status,
                ..
            }) => println!("[{}] -- {}", session_id, new_status),
            Ok(SessionEvent::FocusReleased { session_id }) => {
                let mut focused = focus.lock();
                if focused.as_ref() == Some(&session_id) {
                    *focused = None;
                    println!("[{}] -- focus released", session_id);
                }
            }
            Ok(SessionEvent::Rejected { session_id, reason }) => {
                println!("[{}] !! {}", session_id, reason);
            }
            Ok(SessionEvent::Removed { session_id }) => {
                let mut focused = focus.lock();
                if focused.as_ref() == Some(&session_id) {
                    *focused = None;
                }
                println!("[{}] -- closed", session_id);
            }
            Ok(SessionEvent::Cleared) => {
                *focus.lock() = None;
                println!("-- logged out");
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Renderer fell behind, skipped {} events", skipped)
            }
        }
    }
}

const HELP: &str = "\
:connect <id>          open a session and focus it if nothing is focused
:focus <id>            send plain lines to <id>
:disconnect [id]       close a session (default: focused)
:sessions              list sessions
:history [id]          commands sent on a session (default: focused)
:export <id> <path>    write a session log to a file
:close <id>            forget a closed session
:prune                 forget every closed session
:reconnect             reopen the event channel after it was lost
:logout                disconnect everything and clear sessions
:quit                  leave";

/// One REPL input line
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Empty,
    Help,
    Send(String),
    Connect(ConnectionId),
    Focus(ConnectionId),
    Disconnect(Option<ConnectionId>),
    Sessions,
    History(Option<ConnectionId>),
    Export(ConnectionId, PathBuf),
    Close(ConnectionId),
    Prune,
    Reconnect,
    Logout,
    Quit,
    Invalid(String),
}

fn parse_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(rest) = line.strip_prefix(':') else {
        return ReplCommand::Send(line.to_string());
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let id = |n: usize| args.get(n).and_then(|a| a.parse::<ConnectionId>().ok());

    match (name, args.len()) {
        ("help" | "h", _) => ReplCommand::Help,
        ("connect" | "c", 1) => id(0).map(ReplCommand::Connect).unwrap_or(ReplCommand::Empty),
        ("focus" | "f", 1) => id(0).map(ReplCommand::Focus).unwrap_or(ReplCommand::Empty),
        ("disconnect" | "d", 0) => ReplCommand::Disconnect(None),
        ("disconnect" | "d", 1) => ReplCommand::Disconnect(id(0)),
        ("sessions" | "s", 0) => ReplCommand::Sessions,
        ("history", 0) => ReplCommand::History(None),
        ("history", 1) => ReplCommand::History(id(0)),
        ("export", 2) => match id(0) {
            Some(id) => ReplCommand::Export(id, PathBuf::from(args[1])),
            None => ReplCommand::Empty,
        },
        ("close", 1) => id(0).map(ReplCommand::Close).unwrap_or(ReplCommand::Empty),
        ("prune", 0) => ReplCommand::Prune,
        ("reconnect", 0) => ReplCommand::Reconnect,
        ("logout", 0) => ReplCommand::Logout,
        ("quit" | "q" | "exit", 0) => ReplCommand::Quit,
        _ => ReplCommand::Invalid(format!("Unknown command :{} (try :help)", rest)),
    }
}

/// `[id] text`, with every line of multi-line output prefixed
fn format_line(id: &ConnectionId, line: &LogLine) -> String {
    let marker = match line.kind {
        LogKind::Error => "!! ",
        LogKind::Warning => "-- ",
        _ => "",
    };

    line.text
        .trim_end_matches('\n')
        .lines()
        .map(|text| format!("[{}] {}{}", id, marker, text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_profile(profile: &ProfileRef) -> String {
    let auth = if profile.has_password {
        "password"
    } else if profile.has_private_key {
        "key"
    } else {
        "agent"
    };

    let mut text = format!(
        "{:>6}  {:<20} {:<32} {}",
        profile.id,
        profile.name,
        profile.target(),
        auth
    );
    if let Some(group) = &profile.group {
        text.push_str(&format!("  [{}]", group));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn line(kind: LogKind, text: &str) -> LogLine {
        LogLine {
            seq: 1,
            kind,
            text: text.to_string(),
            segment: 0,
            logged_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("  "), ReplCommand::Empty);
        assert_eq!(parse_line("ls -la"), ReplCommand::Send("ls -la".to_string()));
        assert_eq!(parse_line(":connect 7"), ReplCommand::Connect(ConnectionId::from(7)));
        assert_eq!(parse_line(":d"), ReplCommand::Disconnect(None));
        assert_eq!(
            parse_line(":export 3 /tmp/out.log"),
            ReplCommand::Export(ConnectionId::from(3), PathBuf::from("/tmp/out.log"))
        );
        assert_eq!(parse_line(":history"), ReplCommand::History(None));
        assert_eq!(
            parse_line(":history 4"),
            ReplCommand::History(Some(ConnectionId::from(4)))
        );
        assert_eq!(parse_line(":close 4"), ReplCommand::Close(ConnectionId::from(4)));
        assert_eq!(parse_line(":prune"), ReplCommand::Prune);
        assert_eq!(parse_line(":reconnect"), ReplCommand::Reconnect);
        assert_eq!(parse_line(":q"), ReplCommand::Quit);
        assert!(matches!(parse_line(":teleport"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn test_format_line_prefixes_every_row() {
        let id = ConnectionId::from(7);
        assert_eq!(
            format_line(&id, &line(LogKind::Output, "a\nb\n")),
            "[7] a\n[7] b"
        );
        assert_eq!(
            format_line(&id, &line(LogKind::Error, "Error: auth failed")),
            "[7] !! Error: auth failed"
        );
    }

    #[test]
    fn test_format_profile() {
        let profile = ProfileRef {
            id: ConnectionId::from(2),
            name: "db".to_string(),
            host: "10.0.0.9".to_string(),
            port: 2222,
            username: "root".to_string(),
            has_password: true,
            has_private_key: false,
            group: Some("prod".to_string()),
            tags: None,
            notes: None,
        };
        let text = format_profile(&profile);
        assert!(text.contains("root@10.0.0.9:2222"));
        assert!(text.ends_with("password  [prod]"));
    }

    #[test]
    fn test_cli_parses_shell_ids() {
        let cli = Cli::try_parse_from(["sshdeck", "shell", "7", "db"]).unwrap();
        match cli.command {
            CliCommand::Shell { ids } => {
                assert_eq!(ids, vec![ConnectionId::from(7), ConnectionId::from("db")])
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
