use crate::constants::REQUIRED_TX_FIELDS;
use crate::peers::{ChannelSink, PeerClient, PeerSet};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use postchain_core::{
    unix_timestamp, ChainSnapshot, LedgerError, LedgerService, MineOutcome, PeerRegistry,
    Reconciliation, Record, SealedBlock,
};
use serde::Serialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub type Service = LedgerService<PeerSet, ChannelSink>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub client: PeerClient,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ConsensusReport {
    pub replaced: bool,
    pub length: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(Health { status: "ok" }) }))
        .route("/new_transaction", post(new_transaction))
        .route("/chain", get(chain))
        .route("/mine", get(mine))
        .route("/pending_transactions", get(pending_transactions))
        .route("/add_nodes", post(add_nodes))
        .route("/peers", get(peers))
        .route("/add_block", post(add_block))
        .route("/consensus", get(consensus))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp a submitted post, or `None` if it lacks a required field.
fn validate_transaction(body: Value) -> Option<Record> {
    let Value::Object(mut fields) = body else {
        return None;
    };
    let complete = REQUIRED_TX_FIELDS
        .iter()
        .all(|name| matches!(fields.get(*name), Some(Value::String(s)) if !s.is_empty()));
    if !complete {
        return None;
    }
    fields.insert("timestamp".to_string(), Value::from(unix_timestamp()));
    Some(Value::Object(fields))
}

async fn new_transaction(State(state): State<AppState>, Json(body): Json<Value>) -> (StatusCode, &'static str) {
    match validate_transaction(body) {
        Some(record) => {
            state.service.submit_transaction(record);
            (StatusCode::CREATED, "Success")
        }
        None => (StatusCode::BAD_REQUEST, "Invalid transaction data"),
    }
}

async fn chain(State(state): State<AppState>) -> Json<ChainSnapshot> {
    Json(state.service.get_chain())
}

async fn pending_transactions(State(state): State<AppState>) -> Json<Vec<Record>> {
    Json(state.service.get_pending_transactions())
}

async fn mine(State(state): State<AppState>) -> (StatusCode, String) {
    let service = Arc::clone(&state.service);
    match tokio::task::spawn_blocking(move || service.mine()).await {
        Ok(Ok(MineOutcome::Mined { index })) => (StatusCode::OK, format!("Block #{index} has been mined")),
        Ok(Ok(MineOutcome::NothingToMine)) => {
            (StatusCode::OK, "There are no transactions to be mined".to_string())
        }
        Ok(Err(LedgerError::MiningAbandoned)) => (
            StatusCode::CONFLICT,
            "Mining was preempted by a newer chain; transactions are still pending".to_string(),
        ),
        Ok(Err(err)) => {
            warn!(error = %err, "mining failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(err) => {
            error!(error = %err, "mining task panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "mining task failed".to_string())
        }
    }
}

async fn add_nodes(State(state): State<AppState>, Json(nodes): Json<Vec<String>>) -> (StatusCode, &'static str) {
    if nodes.is_empty() {
        return (StatusCode::BAD_REQUEST, "Invalid data");
    }
    for node in &nodes {
        state.service.peers().add(node);
    }
    (StatusCode::CREATED, "Success")
}

async fn peers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.service.peers().peers())
}

async fn add_block(State(state): State<AppState>, Json(block): Json<SealedBlock>) -> (StatusCode, String) {
    let (block, claimed_hash) = block.into_parts();
    match state.service.receive_block(block, claimed_hash) {
        Ok(index) => {
            info!(index, "accepted peer block");
            (
                StatusCode::CREATED,
                "The mined block was added to the blockchain".to_string(),
            )
        }
        Err(reason) => (
            StatusCode::BAD_REQUEST,
            format!("The block was discarded by the node: {reason}"),
        ),
    }
}

async fn consensus(State(state): State<AppState>) -> Result<Json<ConsensusReport>, (StatusCode, String)> {
    run_consensus(&state).await.map(Json).map_err(|err| {
        error!(error = %err, "consensus failed");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    })
}

/// Pull every peer's chain and adopt the longest valid one.
pub async fn run_consensus(state: &AppState) -> anyhow::Result<ConsensusReport> {
    let peers = state.service.peers().peers();
    let candidates = state.client.fetch_chains(peers).await;
    let service = Arc::clone(&state.service);
    let outcome = tokio::task::spawn_blocking(move || service.reconcile(candidates)).await?;
    let length = state.service.get_chain().length;
    Ok(ConsensusReport {
        replaced: matches!(outcome, Reconciliation::Replaced { .. }),
        length,
    })
}

/// One round of periodic sync. Failures are logged and the round skipped.
pub async fn sync_once(state: &AppState) -> Option<ConsensusReport> {
    match run_consensus(state).await {
        Ok(report) => {
            if report.replaced {
                info!(length = report.length, "periodic sync adopted a peer chain");
            }
            Some(report)
        }
        Err(err) => {
            warn!(error = %err, "periodic sync failed");
            None
        }
    }
}

pub async fn sync_loop(state: AppState, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        sync_once(&state).await;
    }
}
