#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::Result;
use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

mod utils;

use tutorchat::chat::client::ChatClient;
use tutorchat::chat::connection::ConnectionState;
use tutorchat::chat::ChatUpdate;
use tutorchat::config::{self, ChatConfig};
use tutorchat::models::{Direction, Identity, Message};

/// Command line arguments for tutorchat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tutorchat: a console client for the tutoring chat backend.",
    long_about = "tutorchat connects to the chat backend as one identity, loads the roster \
    and lets you talk to one contact at a time.\n\n\
    Commands: /contacts, /select <id>, /leave, /reload, /history, /quit. \
    Any other line is sent to the selected contact."
)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Identity to log in as
    #[arg(long, env = "TUTORCHAT_USER_ID")]
    user: String,

    /// Bearer token for the identity; prompted for when absent
    #[arg(long, env = "TUTORCHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

enum Command {
    Contacts,
    Select(String),
    Leave,
    Reload,
    History,
    Quit,
    Send(String),
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let command = match parts.next()? {
            "/contacts" => Command::Contacts,
            "/select" => Command::Select(parts.next()?.trim().to_string()),
            "/leave" => Command::Leave,
            "/reload" => Command::Reload,
            "/history" => Command::History,
            "/quit" => Command::Quit,
            _ => Command::Send(line.to_string()),
        };
        Some(command)
    }
}

fn format_message(message: &Message) -> String {
    let time = chrono::DateTime::from_timestamp(message.timestamp as i64, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_default();
    match message.direction {
        Direction::Outgoing => format!(
            "[{}] you -> {}: {} ({:?})",
            time,
            message.peer_id,
            message.payload,
            message.delivery_status()
        ),
        Direction::Incoming => format!("[{}] {}: {}", time, message.peer_id, message.payload),
    }
}

fn print_contacts(client: &ChatClient) {
    let directory = client.core().directory();
    if directory.is_empty() {
        println!("No contacts loaded.");
        return;
    }
    for contact in directory.contacts() {
        let marker = if client.core().sessions().is_active(&contact.id) { '*' } else { ' ' };
        println!("{} {} ({}) - {:?}", marker, contact.display_name, contact.id, contact.status);
    }
}

fn print_history(client: &ChatClient) {
    match client.core().active_session() {
        Some(session) => {
            for message in session.messages() {
                println!("{}", format_message(message));
            }
        }
        None => println!("No conversation selected. Use /select <id>."),
    }
}

fn print_update(client: &ChatClient, update: &ChatUpdate) {
    match update {
        ChatUpdate::ConnectionChanged(state) => match state {
            ConnectionState::Connected => println!("* connected"),
            ConnectionState::Reconnecting { attempt } => println!("* connection lost, retrying ({})", attempt),
            ConnectionState::Disconnected(Some(reason)) => println!("* disconnected: {}", reason),
            ConnectionState::Disconnected(None) => println!("* disconnected"),
            ConnectionState::Connecting => println!("* connecting..."),
        },
        ChatUpdate::RosterLoaded { contacts } => println!("* {} contacts loaded", contacts),
        ChatUpdate::PresenceChanged { contact_id, status } => {
            let name = client
                .core()
                .directory()
                .get(contact_id)
                .map(|c| c.display_name.as_str())
                .unwrap_or(contact_id.as_str());
            println!("* {} is {:?}", name, status);
        }
        ChatUpdate::MessageReceived { peer_id, local_seq, active } => {
            let message = client.core().session(peer_id).and_then(|s| s.message(*local_seq));
            match (active, message) {
                (true, Some(message)) => println!("{}", format_message(message)),
                _ => println!("* new message from {}", peer_id),
            }
        }
        ChatUpdate::DeliveryChanged { key, status } => {
            if client.core().sessions().is_active(&key.peer_id) {
                println!("  ({} {:?})", key, status);
            }
        }
        ChatUpdate::DeliveryFailed { key, reason } => println!("* message {} failed: {}", key, reason),
    }
}

async fn reload_contacts(client: &mut ChatClient) {
    match client.load_contacts().await {
        Ok(count) => info!("Roster loaded with {} contacts", count),
        Err(e) => {
            error!("Failed to load contacts: {}", e);
            println!("* could not load contacts: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, args.log_level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
    }
    let config = ChatConfig::load(None)?;

    let token = match args.token {
        Some(token) => token,
        None => {
            eprintln!("Enter access token for {}:", args.user);
            utils::read_line()?
        }
    };
    let identity = Identity::new(args.user, token);

    println!("Connecting to {} as {}...", config.server_url, identity.id);
    let mut client = ChatClient::connect(identity, &config)?;
    reload_contacts(&mut client).await;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = LinesStream::new(stdin.lines());

    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                    None => break,
                };
                let Some(command) = Command::parse(&line) else {
                    continue;
                };
                match command {
                    Command::Contacts => print_contacts(&client),
                    Command::Select(peer_id) => match client.select(&peer_id) {
                        Ok(session) => {
                            println!("* talking to {} ({} messages)", session.peer_id(), session.messages().len());
                        }
                        Err(e) => println!("* {}", e),
                    },
                    Command::Leave => {
                        if let Some(peer_id) = client.deselect() {
                            println!("* left conversation with {}", peer_id);
                        }
                    }
                    Command::Reload => reload_contacts(&mut client).await,
                    Command::History => print_history(&client),
                    Command::Quit => break,
                    Command::Send(text) => {
                        let Some(peer_id) = client.core().active_session().map(|s| s.peer_id().to_string()) else {
                            println!("* no conversation selected, use /select <id>");
                            continue;
                        };
                        if let Err(e) = client.submit(&peer_id, text) {
                            println!("* could not send: {}", e);
                        }
                    }
                }
            }
            update = client.next_update() => {
                match update {
                    Some(update) => print_update(&client, &update),
                    None => {
                        println!("* connection closed");
                        break;
                    }
                }
            }
        }
    }

    client.logout().await;
    while let Some(update) = client.next_update().await {
        print_update(&client, &update);
    }
    let stats = client.core().stats();
    info!(
        "Session ended: {} conversations, {} queued, {} awaiting ack, {} presence updates ({} dropped)",
        stats.sessions, stats.queued, stats.awaiting_ack, stats.presence_applied, stats.presence_dropped
    );
    Ok(())
}
