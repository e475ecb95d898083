use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::errors::{ChainError, ChainResult};
use crate::network::Conn;
use crate::node::{AccountView, NodeHandle, NodeStatus};
use crate::types::{Block, Receipt, Transaction};

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct SubmitResponse {
    hash: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    address: String,
}

pub async fn serve(node: NodeHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { node: node.clone() };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status/node", get(node_status))
        .route("/status/peers", get(peer_list))
        .route("/transactions", post(submit_transaction))
        .route("/transactions/:hash", get(transaction_by_hash))
        .route("/receipts/:hash", get(receipt_by_hash))
        .route("/blocks/latest", get(latest_block))
        .route("/blocks/:height", get(block_by_height))
        .route("/blocks/hash/:hash", get(block_by_hash))
        .route("/accounts/:address", get(account_info))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "RPC server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        address: state.node.address().to_string(),
    })
}

async fn node_status(
    State(state): State<AppState>,
) -> Result<Json<NodeStatus>, (StatusCode, Json<ErrorResponse>)> {
    state.node.node_status().map(Json).map_err(to_http_error)
}

async fn peer_list(State(state): State<AppState>) -> Json<Vec<Conn>> {
    Json(state.node.conn_info())
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(tx): Json<Transaction>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .submit_transaction(tx)
        .map(|hash| Json(SubmitResponse { hash }))
        .map_err(to_http_error)
}

async fn transaction_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Option<Transaction>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .get_transaction(&hash)
        .map(Json)
        .map_err(to_http_error)
}

async fn receipt_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Option<Receipt>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .get_receipt(&hash)
        .map(Json)
        .map_err(to_http_error)
}

async fn latest_block(
    State(state): State<AppState>,
) -> Result<Json<Option<Block>>, (StatusCode, Json<ErrorResponse>)> {
    state.node.latest_block().map(Json).map_err(to_http_error)
}

async fn block_by_height(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> Result<Json<Option<Block>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .get_block(height)
        .map(Json)
        .map_err(to_http_error)
}

async fn block_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<Option<Block>>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .get_block_by_hash(&hash)
        .map(Json)
        .map_err(to_http_error)
}

async fn account_info(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<AccountView>, (StatusCode, Json<ErrorResponse>)> {
    state
        .node
        .get_account(&address)
        .map(Json)
        .map_err(to_http_error)
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        ChainError::Transaction(_) => StatusCode::BAD_REQUEST,
        ChainError::Config(_) => StatusCode::BAD_REQUEST,
        ChainError::Crypto(_) => StatusCode::BAD_REQUEST,
        ChainError::NonceMismatch { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
