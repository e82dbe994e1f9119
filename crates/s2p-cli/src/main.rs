//! # Speech2Prompt CLI
//!
//! The handheld endpoint from a terminal:
//! - `scan` — list desktop peers advertising the bridge service
//! - `pair` — run the PIN handshake with a peer and store the key
//! - `run` — bridge to a paired peer (typed lines stand in for speech)
//! - `peers` / `forget` — manage stored pairings

mod stdin_engine;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use s2p_core::config::AppConfig;
use s2p_link::pairing::FileKeystore;
use s2p_link::sysble::SystemAdapter;
use s2p_link::{LinkManager, PairingFlow, PairingStore, PeerInfo, Transport};
use s2p_speech::{DispatchSink, Dispatcher, RecognizerDriver};

use stdin_engine::StdinEngine;

#[derive(Parser)]
#[command(name = "s2p", version, about = "Voice-to-keyboard bridge, handheld side")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for desktop peers advertising the bridge service
    Scan,
    /// Pair with a peer using the PIN shown on its screen
    Pair {
        /// Peer BLE address (from `scan`)
        address: String,
        /// Numeric PIN displayed by the desktop
        #[arg(long)]
        pin: String,
    },
    /// Connect to a paired peer and bridge typed lines as speech
    Run {
        /// Peer address; defaults to the only stored pairing
        address: Option<String>,
    },
    /// List stored pairings
    Peers,
    /// Forget a stored pairing
    Forget { address: String },
}

struct Stack {
    manager: Arc<LinkManager>,
    transport: Arc<Transport>,
    store: Arc<PairingStore>,
    flow: Arc<PairingFlow>,
}

async fn build_stack(config: &AppConfig) -> anyhow::Result<Stack> {
    let adapter = Arc::new(SystemAdapter::new().await?);
    let manager = LinkManager::new(adapter, config.link.clone());
    let transport = Transport::new(Arc::clone(&manager), config.link.clone());
    transport.start().await?;

    let keystore = FileKeystore::new(&config.store.data_dir);
    let store = Arc::new(PairingStore::new(Box::new(keystore)));
    let flow = PairingFlow::new(
        Arc::clone(&manager),
        Arc::clone(&transport),
        Arc::clone(&store),
        config.device.name.clone(),
    )
    .await?;

    Ok(Stack { manager, transport, store, flow })
}

/// Scan until the requested peer shows up (or the window closes).
async fn find_peer(manager: &Arc<LinkManager>, address: &str) -> anyhow::Result<PeerInfo> {
    let mut peers = manager.start_scan().await?;
    while let Some(peer) = peers.recv().await {
        if peer.address.eq_ignore_ascii_case(address) {
            return Ok(peer);
        }
    }
    anyhow::bail!("peer {address} not seen during the scan window")
}

async fn cmd_scan(config: &AppConfig) -> anyhow::Result<()> {
    let stack = build_stack(config).await?;
    println!("Scanning for {} seconds…", config.link.scan_window_secs);

    let mut peers = stack.manager.start_scan().await?;
    let mut any = false;
    while let Some(peer) = peers.recv().await {
        any = true;
        println!(
            "  {}  {}  rssi={}",
            peer.address,
            peer.name.as_deref().unwrap_or("(unnamed)"),
            peer.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into()),
        );
    }
    if !any {
        println!("No peers found. Is the desktop app running?");
    }
    Ok(())
}

async fn cmd_pair(config: &AppConfig, address: &str, pin: &str) -> anyhow::Result<()> {
    let stack = build_stack(config).await?;
    if stack.store.get(address).await?.is_some() {
        anyhow::bail!("already paired with {address}; `s2p forget {address}` first");
    }

    let peer = find_peer(&stack.manager, address).await?;
    stack.manager.connect(&peer, false).await?;

    let record = stack.flow.pair(pin).await?;
    println!(
        "Paired with {} ({})",
        record.peer_name.as_deref().unwrap_or(&record.peer_address),
        record.peer_device_id,
    );

    stack.manager.disconnect().await;
    Ok(())
}

async fn cmd_run(config: &AppConfig, address: Option<String>) -> anyhow::Result<()> {
    let stack = build_stack(config).await?;

    let stored = match &address {
        Some(addr) => stack.store.get(addr).await?,
        None => stack.store.list().await?.into_iter().next(),
    };
    let Some(stored) = stored else {
        anyhow::bail!("no stored pairing; run `s2p scan` and `s2p pair` first");
    };

    let _watcher = stack.flow.spawn_resume_watcher();
    let peer = find_peer(&stack.manager, &stored.peer_address).await?;
    stack.manager.connect(&peer, true).await?;
    tracing::info!(peer = %peer.address, "connected");

    // Speech side: typed lines play the recognizer.
    let engine = StdinEngine::new();
    let driver = RecognizerDriver::new(engine, config.speech.clone());
    let _watchdog = driver.spawn_watchdog();
    let finals = driver
        .take_finals()
        .await
        .context("recognizer output already taken")?;
    let sink = Arc::clone(&stack.transport) as Arc<dyn DispatchSink>;
    let _dispatcher = Dispatcher::new(sink, &config.speech).spawn(finals);
    driver.start().await?;

    println!("Bridge running. Type a line to send it as speech; ctrl-c to quit.");
    tokio::signal::ctrl_c().await?;

    driver.stop().await?;
    stack.manager.disconnect().await;
    stack.transport.close_session().await;
    Ok(())
}

async fn cmd_peers(config: &AppConfig) -> anyhow::Result<()> {
    let stack = build_stack(config).await?;
    let peers = stack.store.list().await?;
    if peers.is_empty() {
        println!("No stored pairings.");
        return Ok(());
    }
    for peer in peers {
        println!(
            "  {}  {}  paired {}  last seen {}",
            peer.peer_address,
            peer.peer_name.as_deref().unwrap_or("(unnamed)"),
            peer.paired_at.format("%Y-%m-%d"),
            peer.last_connected
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".into()),
        );
    }
    Ok(())
}

async fn cmd_forget(config: &AppConfig, address: &str) -> anyhow::Result<()> {
    let stack = build_stack(config).await?;
    stack.store.forget(address).await?;
    println!("Forgot {address}.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = s2p_core::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s2p=info".into()),
        )
        .with_target(true)
        .init();

    match cli.command {
        Command::Scan => cmd_scan(config).await,
        Command::Pair { address, pin } => cmd_pair(config, &address, &pin).await,
        Command::Run { address } => cmd_run(config, address).await,
        Command::Peers => cmd_peers(config).await,
        Command::Forget { address } => cmd_forget(config, &address).await,
    }
}
