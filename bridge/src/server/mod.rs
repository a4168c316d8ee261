// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operational HTTP surface of the node: liveness, health, relay status,
//! transfer lookups and the operator retry of failed transfers.

use crate::error::BridgeError;
use crate::server::handler::BridgeRequestHandlerTrait;
use crate::status::NodeStatus;
use crate::types::Transfer;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub mod handler;

pub const APPLICATION_JSON: &str = "application/json";

pub const PING_PATH: &str = "/";
pub const HEALTH_PATH: &str = "/health";
pub const STATUS_PATH: &str = "/status";
pub const TRANSFERS_PATH: &str = "/transfers";
pub const TRANSFER_PATH: &str = "/transfers/:transfer_id";
pub const RETRY_TRANSFER_PATH: &str = "/transfers/:transfer_id/retry";

#[derive(Debug, Deserialize)]
pub struct ListTransfersParams {
    pub state: String,
    pub direction: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub problems: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Binds `socket_address` and serves the router. Returns the bound address,
/// which differs from the requested one when port 0 was asked for.
pub async fn run_server(
    socket_address: &SocketAddr,
    handler: impl BridgeRequestHandlerTrait + Sync + Send + 'static,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(socket_address).await?;
    let local_addr = listener.local_addr()?;
    let router = make_router(Arc::new(handler));
    info!("Bridge status server listening on {local_addr}");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Bridge status server stopped: {e}");
        }
    });
    Ok((local_addr, handle))
}

pub(crate) fn make_router(
    handler: Arc<impl BridgeRequestHandlerTrait + Sync + Send + 'static>,
) -> Router {
    Router::new()
        .route(PING_PATH, get(ping))
        .route(HEALTH_PATH, get(handle_health))
        .route(STATUS_PATH, get(handle_status))
        .route(TRANSFERS_PATH, get(handle_list_transfers))
        .route(TRANSFER_PATH, get(handle_get_transfer))
        .route(RETRY_TRANSFER_PATH, post(handle_retry_transfer))
        .with_state(handler)
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            BridgeError::TransferNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::StaleState { .. } | BridgeError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            BridgeError::ValidationError(_) | BridgeError::InsufficientLiquidity(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BridgeError::RpcError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn ping() -> &'static str {
    "ok"
}

async fn handle_health(
    State(handler): State<Arc<impl BridgeRequestHandlerTrait + Sync + Send>>,
) -> (StatusCode, Json<HealthResponse>) {
    let problems = handler.handle_health().await;
    let status = if problems.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            healthy: problems.is_empty(),
            problems,
        }),
    )
}

async fn handle_status(
    State(handler): State<Arc<impl BridgeRequestHandlerTrait + Sync + Send>>,
) -> Result<Json<NodeStatus>, BridgeError> {
    handler.handle_status().await
}

async fn handle_list_transfers(
    Query(params): Query<ListTransfersParams>,
    State(handler): State<Arc<impl BridgeRequestHandlerTrait + Sync + Send>>,
) -> Result<Json<Vec<Transfer>>, BridgeError> {
    handler
        .handle_list_transfers(params.state, params.direction)
        .await
}

async fn handle_get_transfer(
    Path(transfer_id): Path<String>,
    State(handler): State<Arc<impl BridgeRequestHandlerTrait + Sync + Send>>,
) -> Result<Json<Transfer>, BridgeError> {
    handler.handle_get_transfer(transfer_id).await
}

async fn handle_retry_transfer(
    Path(transfer_id): Path<String>,
    State(handler): State<Arc<impl BridgeRequestHandlerTrait + Sync + Send>>,
) -> Result<Json<Transfer>, BridgeError> {
    handler.handle_retry_transfer(transfer_id).await
}
