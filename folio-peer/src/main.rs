//! folio command-line peer
//!
//! Syncs a JSON library file with one other device on the LAN, then writes
//! the merged library back. Both sides name each other:
//!
//!   folio-peer --device-id laptop --library laptop.json --port 8963 \
//!       --peer-id tablet --peer-addr 192.168.1.31:8963
//!
//! The device with the smaller id listens; the other dials.

use anyhow::{Context, Result};
use clap::Parser;
use folio_peer::{PeerConfig, StaticDiscovery, load_library, save_library, static_peer};
use folio_sync::{
    ConflictResolutionStrategy, CoordinatorConfig, DEFAULT_PORT, SyncCoordinator,
    TcpChannelProvider,
};
use folio_types::{DeviceId, DeviceInfo, DeviceType};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "folio-peer")]
#[command(about = "Sync a folio library with another device on the LAN")]
struct Args {
    /// This device's id
    #[arg(long)]
    device_id: DeviceId,

    /// Human-readable device name
    #[arg(short, long, default_value = "folio-peer")]
    name: String,

    /// Library snapshot to sync (created if missing)
    #[arg(short, long)]
    library: PathBuf,

    /// Address to listen on when this side is the server
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Id of the device to sync with
    #[arg(long)]
    peer_id: DeviceId,

    /// Address of the device to sync with
    #[arg(long)]
    peer_addr: SocketAddr,

    /// Conflict strategy: latest, local, remote, merge
    #[arg(short, long)]
    strategy: Option<ConflictResolutionStrategy>,

    /// Optional JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let peer_config = match &args.config {
        Some(path) => PeerConfig::load(path)?,
        None => PeerConfig::default(),
    };

    let app_version = env!("CARGO_PKG_VERSION");
    let local = DeviceInfo::new(
        args.device_id.clone(),
        args.name.clone(),
        DeviceType::Desktop,
        app_version,
        args.bind,
        args.port,
    );
    let mut config = peer_config.apply(CoordinatorConfig::new(local.clone()))?;
    if let Some(strategy) = args.strategy {
        config = config.with_conflict_strategy(strategy);
    }

    let store = Arc::new(load_library(&args.library)?);
    let peer = static_peer(args.peer_id.clone(), args.peer_addr, app_version);
    let coordinator = SyncCoordinator::new(
        config,
        store.clone(),
        Arc::new(StaticDiscovery::new(vec![peer.clone()])),
        Arc::new(TcpChannelProvider::new(SocketAddr::new(args.bind, args.port))),
    );

    for id in peer_config.trusted_ids()? {
        let unaddressed = static_peer(id, SocketAddr::new(args.bind, 0), app_version);
        coordinator.trust_device(&unaddressed).await?;
    }

    println!("\n========================================");
    println!("  folio peer");
    println!("========================================");
    println!("  Device:   {} ({})", local.device_name, local.device_id);
    println!("  Listen:   {}:{}", args.bind, args.port);
    println!("  Peer:     {} at {}", peer.device_id, args.peer_addr);
    println!("  Library:  {}", args.library.display());
    println!("  Strategy: {}", coordinator.config().conflict_strategy);
    println!("========================================\n");

    coordinator.start_discovery().await?;

    let outcome = tokio::select! {
        outcome = coordinator.sync_with_device(&peer) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling sync");
            coordinator.cancel_sync();
            Err(folio_sync::SyncError::Cancelled)
        }
    };

    coordinator.shutdown().await?;

    let summary = outcome.context("Sync failed")?;
    save_library(&store, &args.library).await?;
    info!("Library saved to {}", args.library.display());

    println!("  Synced with:  {}", summary.device_id);
    println!("  Sent:         {}", summary.items_sent);
    println!("  Received:     {}", summary.items_received);
    println!("  Conflicts:    {}", summary.conflicts);
    println!("  Duration:     {:?}", summary.duration);
    Ok(())
}
