#![forbid(unsafe_code)]

use huddlec::config::{load_config, Cli, Commands};
use huddlec::dispatch::ClientEvent;
use huddlec::dry_run::DryRunFactory;
use huddlec::engine::LocalMedia;
use huddlec::link::LinkState;
use huddlec::relay::{Client, ConnStatus};

use clap::Parser;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn",
            1 => "huddlec=debug,info",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

// ── Event output ────────────────────────────────────────────────────

fn print_event(event: &ClientEvent) {
    let color = tty();
    let (reset, bold, dim) = if color {
        (RESET, BOLD, DIM)
    } else {
        ("", "", "")
    };
    match event {
        ClientEvent::Joined { self_id, roster } => {
            println!("{bold}joined{reset} as {self_id}");
            for p in roster {
                println!("  {dim}present{reset} {} {dim}({}){reset}", p.name, p.id);
            }
        }
        ClientEvent::PeerJoined(p) => {
            println!("{dim}+{reset} {} {dim}({}){reset}", p.name, p.id);
        }
        ClientEvent::PeerLeft(id) => println!("{dim}- {id}{reset}"),
        ClientEvent::Chat(msg) => {
            let cyan = if color { CYAN } else { "" };
            println!(
                "{dim}{}{reset} {cyan}{}{reset}: {}",
                msg.received_at.format("%H:%M:%S"),
                msg.sender,
                msg.text
            );
        }
        ClientEvent::Link { peer, state } => {
            let (mark, label) = match state {
                LinkState::Established => (GREEN, "established"),
                LinkState::Failed => (YELLOW, "failed, retrying"),
                LinkState::Lost => (RED, "lost"),
            };
            let mark = if color { mark } else { "" };
            println!("{mark}●{reset} link {peer} {label}");
        }
        ClientEvent::RemoteTrack { peer, track_id } => {
            println!("{dim}media from {peer}: {track_id}{reset}");
        }
        ClientEvent::RelayError(message) => {
            let red = if color { RED } else { "" };
            println!("{red}relay error:{reset} {message}");
        }
    }
}

fn print_roster(client: &Client) {
    let (reset, dim) = if tty() { (RESET, DIM) } else { ("", "") };
    let roster = client.roster();
    if roster.is_empty() {
        println!("{dim}nobody else here{reset}");
    }
    for p in roster {
        println!("  {} {dim}({}){reset}", p.name, p.id);
    }
}

// ── Join ────────────────────────────────────────────────────────────

async fn run_join(cli: &Cli, name: Option<&str>) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref relay) = cli.relay {
        config.relay = relay.clone();
    }
    if let Some(name) = name {
        config.name = Some(name.to_string());
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ Huddle{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Relay{RESET}      {}", config.relay);
        eprintln!("  {DIM}Type a line to chat, /who to list peers, Ctrl-D or Ctrl-C to leave{RESET}");
        eprintln!();
    }

    let media = LocalMedia {
        tracks: vec!["audio".to_string(), "video".to_string()],
    };
    let (client, mut events) = Client::spawn(Arc::new(config), Arc::new(DryRunFactory), media);
    let mut status = client.status();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) if line.trim() == "/who" => print_roster(&client),
                Some(line) => client.send_chat(line).await?,
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                match current {
                    ConnStatus::Connected => info!("relay connected"),
                    ConnStatus::Connecting => info!("connecting to relay"),
                    ConnStatus::Disconnected => eprintln!("{DIM}relay disconnected{RESET}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.leave().await;
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Join { name } => run_join(&cli, name.as_deref()).await?,

        Commands::Config => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(ref relay) = cli.relay {
                config.relay = relay.clone();
            }
            println!("{config:#?}");
            if let Err(e) = config.validate() {
                println!("{RED}\u{2717}{RESET} Config invalid: {DIM}{e}{RESET}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
