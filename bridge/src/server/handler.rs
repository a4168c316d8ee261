// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::ChainClientInner;
use crate::error::{BridgeError, BridgeResult};
use crate::relay::RelayEngine;
use crate::status::{NodeStatus, StatusRegistry};
use crate::types::{Direction, Transfer, TransferId, TransferState};
use async_trait::async_trait;
use axum::Json;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tap::TapFallible;
use tracing::{info, warn};

#[async_trait]
pub trait BridgeRequestHandlerTrait {
    // Problems that make the node unhealthy. Empty when healthy.
    async fn handle_health(&self) -> Vec<String>;

    async fn handle_status(&self) -> Result<Json<NodeStatus>, BridgeError>;

    async fn handle_get_transfer(&self, transfer_id: String)
        -> Result<Json<Transfer>, BridgeError>;

    async fn handle_list_transfers(
        &self,
        state: String,
        direction: Option<String>,
    ) -> Result<Json<Vec<Transfer>>, BridgeError>;

    // Puts a `Failed` transfer back to `Authorized` after revalidation.
    async fn handle_retry_transfer(&self, transfer_id: String)
        -> Result<Json<Transfer>, BridgeError>;
}

// The operator retry path of one relay direction.
#[async_trait]
pub trait FailedTransferRetrier: Send + Sync {
    async fn retry_failed_transfer(&self, transfer_id: TransferId) -> BridgeResult<Transfer>;
}

#[async_trait]
impl<S, D> FailedTransferRetrier for RelayEngine<S, D>
where
    S: ChainClientInner + 'static,
    D: ChainClientInner + 'static,
{
    async fn retry_failed_transfer(&self, transfer_id: TransferId) -> BridgeResult<Transfer> {
        RelayEngine::retry_failed_transfer(self, transfer_id).await
    }
}

pub struct BridgeRequestHandler {
    status: Arc<StatusRegistry>,
    retriers: BTreeMap<Direction, Arc<dyn FailedTransferRetrier>>,
}

impl BridgeRequestHandler {
    pub fn new(status: Arc<StatusRegistry>) -> Self {
        Self {
            status,
            retriers: BTreeMap::new(),
        }
    }

    pub fn with_retrier(
        mut self,
        direction: Direction,
        retrier: Arc<dyn FailedTransferRetrier>,
    ) -> Self {
        self.retriers.insert(direction, retrier);
        self
    }
}

fn parse_transfer_id(transfer_id: &str) -> BridgeResult<TransferId> {
    let hex = transfer_id.trim_start_matches("0x");
    if hex.len() != 64 {
        return Err(BridgeError::InvalidRequest(format!(
            "Transfer id must be 32 hex encoded bytes, got {transfer_id:?}"
        )));
    }
    TransferId::from_str(hex)
        .map_err(|e| BridgeError::InvalidRequest(format!("Invalid transfer id {transfer_id:?}: {e}")))
}

#[async_trait]
impl BridgeRequestHandlerTrait for BridgeRequestHandler {
    async fn handle_health(&self) -> Vec<String> {
        self.status.problems()
    }

    async fn handle_status(&self) -> Result<Json<NodeStatus>, BridgeError> {
        self.status.snapshot().map(Json)
    }

    async fn handle_get_transfer(
        &self,
        transfer_id: String,
    ) -> Result<Json<Transfer>, BridgeError> {
        let transfer_id = parse_transfer_id(&transfer_id)?;
        self.status
            .store()
            .get_transfer(&transfer_id)?
            .map(Json)
            .ok_or(BridgeError::TransferNotFound(transfer_id))
    }

    async fn handle_list_transfers(
        &self,
        state: String,
        direction: Option<String>,
    ) -> Result<Json<Vec<Transfer>>, BridgeError> {
        let state = TransferState::from_str(&state).map_err(BridgeError::InvalidRequest)?;
        let direction = direction
            .as_deref()
            .map(Direction::from_str)
            .transpose()
            .map_err(BridgeError::InvalidRequest)?;
        self.status
            .store()
            .get_transfers_by_state(state, direction)
            .map(Json)
    }

    async fn handle_retry_transfer(
        &self,
        transfer_id: String,
    ) -> Result<Json<Transfer>, BridgeError> {
        let transfer_id = parse_transfer_id(&transfer_id)?;
        let transfer = self
            .status
            .store()
            .get_transfer(&transfer_id)?
            .ok_or(BridgeError::TransferNotFound(transfer_id))?;
        let retrier = self.retriers.get(&transfer.direction()).ok_or_else(|| {
            BridgeError::InternalError(format!(
                "No relay is running for {}",
                transfer.direction()
            ))
        })?;
        info!(?transfer_id, "Operator requested retry of failed transfer");
        retrier
            .retry_failed_transfer(transfer_id)
            .await
            .tap_err(|e| warn!(?transfer_id, "Retry rejected: {e}"))
            .map(Json)
    }
}
