mod api;
mod constants;
mod peers;

use api::{AppState, Service};
use clap::Parser;
use constants::{DEFAULT_LISTEN, DEFAULT_PEER_TIMEOUT_MS};
use peers::{ChannelSink, PeerClient, PeerSet};
use postchain_core::{constants::DEFAULT_DIFFICULTY, Ledger, LedgerConfig, LedgerService};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:8000
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Leading hex zeros required of every block hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// Fixed genesis timestamp; nodes sharing it share a genesis block
    #[arg(long)]
    genesis_timestamp: Option<u64>,

    /// Peer node address (repeatable, or comma separated)
    #[arg(long = "peer", value_delimiter = ',')]
    peers: Vec<String>,

    /// Timeout for each request to a peer, in milliseconds
    #[arg(long, default_value_t = DEFAULT_PEER_TIMEOUT_MS)]
    peer_timeout_ms: u64,

    /// Run consensus against all peers every N seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    sync_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let ledger = Ledger::new(LedgerConfig {
        difficulty: args.difficulty,
        genesis_timestamp: args.genesis_timestamp,
    })?;
    info!(
        difficulty = ledger.difficulty(),
        genesis = ledger.last_block().hash(),
        "ledger ready"
    );

    let peer_set = PeerSet::new(&args.peers);
    let (sink, announcements) = ChannelSink::new();
    let service: Arc<Service> = Arc::new(LedgerService::new(ledger, peer_set.clone(), sink));
    let client = PeerClient::new(Duration::from_millis(args.peer_timeout_ms))?;

    tokio::spawn(peers::run_announcer(client.clone(), peer_set, announcements));

    let state = AppState { service, client };
    if args.sync_interval_secs > 0 {
        tokio::spawn(api::sync_loop(
            state.clone(),
            Duration::from_secs(args.sync_interval_secs),
        ));
    }

    let app = api::router(state);
    let addr: SocketAddr = args.listen.parse()?;
    info!("postchain-node listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
