// ananta: command-line peer
//
// Cross-platform (macOS, Linux, Windows) front end for the Ananta core:
// identity bootstrap, config management and an interactive node.

mod config;

use ananta_core::crypto::RatchetSession;
use ananta_core::identity::{IdentityManager, IdentityStore, PlainGuard};
use ananta_core::offline::OfflineRecord;
use ananta_core::search::SearchResponse;
use ananta_core::store::{SledStorage, StorageBackend};
use ananta_core::transfer::{TransferDirection, TransferRecord, TransferStatus};
use ananta_core::{IdentityKeys, Node};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ananta")]
#[command(about = "Ananta: peer-to-peer chat, search and file sharing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize new identity
    Init,
    /// Show identity information
    Identity,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start an interactive node
    Start {
        /// Listen for local-network signaling on this port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run self-tests
    Test,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Peers reachable on the local network
    Peer {
        #[command(subcommand)]
        action: PeerAction,
    },
}

#[derive(Subcommand)]
enum PeerAction {
    Add { peer_id: String, addr: String },
    Remove { peer_id: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config);

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Identity => cmd_identity().await,
        Commands::Config { action } => cmd_config(config, action).await,
        Commands::Start { port } => cmd_start(config, port).await,
        Commands::Test => cmd_test().await,
    }
}

fn init_logging(config: &config::Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ananta.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn open_storage() -> Result<Arc<SledStorage>> {
    let path = config::Config::data_dir()?.join("storage");
    let storage = SledStorage::open(&path.to_string_lossy()).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

fn load_identity(db: Arc<dyn StorageBackend>) -> Result<IdentityKeys> {
    let mut manager = IdentityManager::new(IdentityStore::persistent(db, Arc::new(PlainGuard)));
    let keys = manager.initialize().context("Failed to load identity")?;
    Ok(keys.clone())
}

fn print_identity(keys: &IdentityKeys) {
    println!("  ID:         {}", keys.peer_id().bright_cyan());
    println!("  Public Key: {}", keys.public_key_hex().bright_yellow());
}

async fn cmd_init() -> Result<()> {
    println!("{}", "Initializing Ananta...".bold());
    println!();

    println!(
        "  {} Configuration: {}",
        "✓".green(),
        config::Config::config_file()?.display()
    );
    let data_dir = config::Config::data_dir()?;
    println!("  {} Data directory: {}", "✓".green(), data_dir.display());

    let keys = load_identity(open_storage()?)?;
    println!("  {} Identity ready", "✓".green());
    println!();

    println!("{}", "Identity Information:".bold());
    print_identity(&keys);
    println!();

    println!("{}", "Next steps:".bold());
    println!(
        "  • Pick signaling: {}",
        "ananta config set http_url <url>".bright_green()
    );
    println!("  • Start node:     {}", "ananta start".bright_green());

    Ok(())
}

async fn cmd_identity() -> Result<()> {
    let keys = load_identity(open_storage()?)?;
    println!("{}", "Identity Information".bold());
    print_identity(&keys);
    Ok(())
}

async fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
            println!();
            print_lan_peers(&config);
        }

        ConfigAction::Peer { action } => match action {
            PeerAction::Add { peer_id, addr } => {
                config.add_lan_peer(&peer_id, &addr)?;
                println!("{} Added LAN peer {} at {}", "✓".green(), peer_id, addr);
            }
            PeerAction::Remove { peer_id } => {
                if config.remove_lan_peer(&peer_id)? {
                    println!("{} Removed LAN peer", "✓".green());
                } else {
                    println!("{}", "No such LAN peer.".dimmed());
                }
            }
            PeerAction::List => print_lan_peers(&config),
        },
    }

    Ok(())
}

fn print_lan_peers(config: &config::Config) {
    println!("{}", "LAN peers:".bold());
    if config.lan_peers.is_empty() {
        println!("  {}", "(none configured)".dimmed());
    } else {
        for (peer_id, addr) in &config.lan_peers {
            println!("  • {} {}", peer_id, addr.dimmed());
        }
    }
}

async fn cmd_start(config: config::Config, port: Option<u16>) -> Result<()> {
    let mut node_config = config.node.clone();
    if port.is_some() {
        node_config.signaling.local_port = port;
    }
    if node_config.signaling.is_empty() {
        // Nothing configured: local network only, on an ephemeral port
        node_config.signaling.local_port = Some(0);
    }
    if node_config.transfer.download_dir.is_none() {
        node_config.transfer.download_dir = Some(config::Config::data_dir()?.join("downloads"));
    }

    let storage = open_storage()?;
    let keys = load_identity(storage.clone())?;

    println!("{}", "Ananta: starting...".bold());
    println!();
    print_identity(&keys);
    println!();

    let node = Arc::new(
        Node::builder(node_config)
            .identity(keys)
            .storage(storage)
            .build()
            .await
            .context("Failed to build node")?,
    );

    if let Some(local) = node.local_signaling() {
        for (peer_id, addr) in config.lan_peer_addrs() {
            local.add_peer(&peer_id, addr);
        }
        println!("{} LAN signaling on {}", "✓".green(), local.local_addr());
    }
    install_listeners(&node);
    node.start();
    watch_requests(&node);
    tracing::info!("Interactive node {} running", node.local_id());

    println!("{} Node started", "✓".green());
    println!();
    print_help();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    prompt();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let line = line.trim();
        if line == "quit" || line == "exit" {
            break;
        }
        if !line.is_empty() {
            if let Err(e) = run_command(&node, line).await {
                tracing::warn!("Command {:?} failed: {:#}", line, e);
                println!("{} {}", "✗".red(), e);
            }
        }
        prompt();
    }

    println!("Shutting down...");
    tracing::info!("Stopping node {}", node.local_id());
    node.shutdown().await;
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn print_help() {
    println!("{}", "Commands:".bold());
    let commands = [
        ("connect <peer>", "ask a peer to pair"),
        ("accept <peer>", "accept a pairing request"),
        ("decline <peer>", "decline a pairing request"),
        ("close <peer>", "disconnect and forget pairing"),
        ("requests", "pending pairing requests"),
        ("peers", "connected peers"),
        ("send <peer> <message>", "chat"),
        ("hold <relay> <peer> <message>", "leave a message with a relay"),
        ("share <path>", "share a file"),
        ("search <query>", "search the mesh"),
        ("get <peer> <file>", "download a shared file"),
        ("sendfile <peer> <path>", "push a file"),
        ("transfers", "list transfers"),
        ("pause|resume|cancel <id>", "control a transfer"),
        ("quit", "stop the node"),
    ];
    for (usage, what) in commands {
        println!("  {:<32} {}", usage.bright_green(), what.dimmed());
    }
    println!();
}

fn install_listeners(node: &Arc<Node>) {
    node.add_chat_listener(Arc::new(|peer: &str, text: &str| {
        println!("\n{} {}: {}", "←".bright_blue(), short(peer).bright_cyan(), text);
        prompt();
    }));

    node.search_manager()
        .add_listener(Arc::new(|response: &SearchResponse| {
            println!(
                "\n{} {} result(s) from {} ({} hop(s))",
                "🔍".bold(),
                response.results.len(),
                short(&response.peer_id).bright_cyan(),
                response.path.len()
            );
            for file in &response.results {
                println!("   • {} {}", file.name, format_size(file.size).dimmed());
            }
            prompt();
        }));

    node.offline()
        .add_bundle_listener(Arc::new(|holder: &str, records: &[OfflineRecord]| {
            println!(
                "\n{} {} held message(s) delivered by {}",
                "✉".bold(),
                records.len(),
                short(holder).bright_cyan()
            );
            for record in records {
                println!(
                    "   • from {} at {}",
                    short(&record.sender).bright_cyan(),
                    format_timestamp(record.ts)
                );
            }
            prompt();
        }));
}

fn watch_requests(node: &Arc<Node>) {
    let mut rx = node.requests().subscribe();
    tokio::spawn(async move {
        let mut announced = std::collections::HashSet::new();
        while rx.changed().await.is_ok() {
            let incoming: Vec<String> = rx
                .borrow()
                .iter()
                .filter(|(_, state)| state.incoming)
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in &incoming {
                if announced.insert(peer.clone()) {
                    println!(
                        "\n{} Pairing request from {} (accept {})",
                        "?".bright_yellow(),
                        peer.bright_cyan(),
                        short(peer)
                    );
                    prompt();
                }
            }
            announced.retain(|peer| incoming.contains(peer));
        }
    });
}

async fn run_command(node: &Arc<Node>, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "help" => print_help(),
        "connect" => {
            let peer = resolve_peer(node, rest);
            node.request_connection(&peer).await?;
            println!("{} Request sent to {}", "✓".green(), short(&peer));
        }
        "accept" => {
            let peer = resolve_peer(node, rest);
            node.accept_connection(&peer).await?;
            println!("{} Accepted {}", "✓".green(), short(&peer));
        }
        "decline" => {
            let peer = resolve_peer(node, rest);
            node.decline_connection(&peer);
            println!("{} Declined {}", "✓".green(), short(&peer));
        }
        "close" => {
            let peer = resolve_peer(node, rest);
            node.close_connection(&peer).await;
            println!("{} Closed {}", "✓".green(), short(&peer));
        }
        "requests" => {
            let snapshot = node.requests().snapshot();
            if snapshot.is_empty() {
                println!("No pending requests.");
            }
            for (peer, state) in snapshot {
                let direction = match (state.incoming, state.outgoing) {
                    (true, true) => "both ways",
                    (true, false) => "incoming",
                    _ => "outgoing",
                };
                println!("  • {} {}", peer.bright_cyan(), direction.dimmed());
            }
        }
        "peers" => {
            let peers = node.connected_peers();
            if peers.is_empty() {
                println!("No peers.");
            }
            for peer in peers {
                println!("  • {}", peer.bright_cyan());
            }
        }
        "send" => {
            let (peer, text) = two_args(rest, "send <peer> <message>")?;
            let peer = resolve_peer(node, peer);
            node.send_chat(&peer, text)?;
            println!("{} Sent", "✓".green());
        }
        "hold" => {
            let (relay, rest) = two_args(rest, "hold <relay> <peer> <message>")?;
            let (recipient, text) = two_args(rest, "hold <relay> <peer> <message>")?;
            let relay = resolve_peer(node, relay);
            node.offline()
                .store_message(&relay, &resolve_peer(node, recipient), text.as_bytes())?;
            println!("{} Left with {}", "✓".green(), short(&relay));
        }
        "share" => {
            node.share_path(&PathBuf::from(rest))?;
            println!("{} Sharing {}", "✓".green(), rest);
        }
        "search" => {
            if rest.is_empty() {
                anyhow::bail!("Usage: search <query>");
            }
            node.search(rest)?;
            println!("{} Searching...", "✓".green());
        }
        "get" => {
            let (peer, name) = two_args(rest, "get <peer> <file>")?;
            node.request_file(&resolve_peer(node, peer), name)?;
            println!("{} Requested {}", "✓".green(), name);
        }
        "sendfile" => {
            let (peer, path) = two_args(rest, "sendfile <peer> <path>")?;
            let peer = resolve_peer(node, peer);
            let path = PathBuf::from(path);
            let node = node.clone();
            tokio::spawn(async move {
                match node.send_file(&peer, &path).await {
                    Ok(_) => println!("\n{} Sent {}", "✓".green(), path.display()),
                    Err(e) => println!("\n{} {}: {}", "✗".red(), path.display(), e),
                }
                prompt();
            });
        }
        "transfers" => {
            let records = node.ledger().all();
            if records.is_empty() {
                println!("No transfers.");
            }
            for record in records {
                print_transfer(&record);
            }
        }
        "pause" => {
            node.ledger().pause(rest)?;
        }
        "resume" => {
            node.ledger().resume(rest)?;
        }
        "cancel" => {
            node.ledger().cancel(rest)?;
        }
        _ => println!("Unknown command. Try: help"),
    }
    Ok(())
}

fn two_args<'a>(rest: &'a str, usage: &str) -> Result<(&'a str, &'a str)> {
    match rest.split_once(' ') {
        Some((first, second)) if !second.trim().is_empty() => Ok((first, second.trim())),
        _ => anyhow::bail!("Usage: {}", usage),
    }
}

/// Expand a unique prefix of a known peer id
fn resolve_peer(node: &Node, query: &str) -> String {
    let mut known = node.connected_peers();
    known.extend(node.requests().snapshot().into_keys());
    known.sort();
    known.dedup();
    let matches: Vec<&String> = known.iter().filter(|id| id.starts_with(query)).collect();
    match matches.as_slice() {
        [only] => only.to_string(),
        _ => query.to_string(),
    }
}

fn short(peer_id: &str) -> &str {
    ananta_core::short_id(peer_id)
}

fn print_transfer(record: &TransferRecord) {
    let arrow = match record.direction {
        TransferDirection::Incoming => "←".bright_blue(),
        TransferDirection::Outgoing => "→".bright_green(),
    };
    let status = match record.status {
        TransferStatus::Completed => "completed".green(),
        TransferStatus::Failed => "failed".red(),
        TransferStatus::Cancelled => "cancelled".red(),
        TransferStatus::Paused => "paused".yellow(),
        TransferStatus::InProgress => "in progress".normal(),
        TransferStatus::Pending => "pending".dimmed(),
    };
    println!(
        "{} {} {} {} {}/{} [{}]",
        arrow,
        record.id.dimmed(),
        record.file_name,
        short(&record.peer_id).bright_cyan(),
        format_size(record.transferred_bytes),
        record
            .total_bytes
            .map(format_size)
            .unwrap_or_else(|| "?".to_string()),
        status
    );
    println!("   started {}", format_timestamp(record.started_at).dimmed());
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_timestamp(millis: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp((millis / 1000) as i64, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn cmd_test() -> Result<()> {
    println!("{}", "Running self-tests...".bold());
    println!();

    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    anyhow::ensure!(alice_keys.peer_id() != bob_keys.peer_id());
    println!("{} Identity generation", "✓".green());

    let mut alice = RatchetSession::new(true);
    let mut bob = RatchetSession::new(false);
    let mut to_bob = Vec::new();
    let mut to_alice = Vec::new();
    alice.ensure_handshake(|frame| to_bob.push(frame))?;
    for frame in &to_bob {
        bob.handle_control_frame(frame, |reply| to_alice.push(reply));
    }
    for frame in &to_alice {
        alice.handle_control_frame(frame, |_| {});
    }
    anyhow::ensure!(alice.is_ready() && bob.is_ready(), "handshake did not complete");
    println!("{} Key agreement", "✓".green());

    let sealed = alice.encrypt_text("Test message")?;
    anyhow::ensure!(bob.decrypt_text(&sealed)? == "Test message");
    println!("{} Message encryption ({} bytes)", "✓".green(), sealed.len());

    let mut tampered = alice.encrypt_binary(b"Secret")?;
    if let Some(last) = tampered.last_mut() {
        *last ^= 0x80;
    }
    anyhow::ensure!(bob.decrypt_binary(&tampered).is_err(), "tampering went unnoticed");
    println!("{} Tamper detection", "✓".green());

    println!();
    println!("{}", "All tests passed!".green().bold());

    Ok(())
}
