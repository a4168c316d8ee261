// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use ethers::types::{Address as EthAddress, TxHash};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::retry_with_max_elapsed_time;
use crate::types::{
    DepositEvent, NetworkId, SignedAuthorization, SubmissionStatus, TokenId, TransferId,
    WithdrawalStatus,
};

// RPC surface of one network's bridge contract, abstracted so the relay can
// run against a real node or an in-memory chain.
#[async_trait]
pub trait ChainClientInner: Send + Sync {
    fn bridge_address(&self) -> EthAddress;

    async fn get_chain_id(&self) -> BridgeResult<u64>;

    async fn get_latest_block_number(&self) -> BridgeResult<u64>;

    // Deposit events in the inclusive block range.
    async fn get_deposit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<DepositEvent>>;

    async fn is_token_registered(&self, token_id: TokenId) -> BridgeResult<bool>;

    async fn submit_withdrawal(&self, auth: &SignedAuthorization) -> BridgeResult<TxHash>;

    async fn get_withdrawal_status(&self, transfer_id: TransferId)
        -> BridgeResult<WithdrawalStatus>;

    async fn get_submission_status(&self, tx_hash: TxHash) -> BridgeResult<SubmissionStatus>;
}

pub struct ChainClient<P> {
    network: NetworkId,
    inner: P,
    confirmation_depth: u64,
    // Upper bound on retrying a failed read before the error is returned.
    rpc_retry_max_elapsed: Duration,
    bridge_metrics: Arc<BridgeMetrics>,
}

impl<P> ChainClient<P>
where
    P: ChainClientInner,
{
    pub fn new(
        network: NetworkId,
        inner: P,
        confirmation_depth: u64,
        rpc_retry_max_elapsed: Duration,
        bridge_metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            network,
            inner,
            confirmation_depth,
            rpc_retry_max_elapsed,
            bridge_metrics,
        }
    }

    // No confirmation depth and no read retries.
    pub fn new_for_testing(network: NetworkId, inner: P) -> Self {
        Self::new(
            network,
            inner,
            0,
            Duration::ZERO,
            Arc::new(BridgeMetrics::new_for_testing()),
        )
    }

    pub fn with_confirmation_depth(mut self, confirmation_depth: u64) -> Self {
        self.confirmation_depth = confirmation_depth;
        self
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn confirmation_depth(&self) -> u64 {
        self.confirmation_depth
    }

    pub fn bridge_address(&self) -> EthAddress {
        self.inner.bridge_address()
    }

    pub async fn describe(&self) -> BridgeResult<()> {
        let chain_id = self.get_chain_id().await?;
        let block_number = self.get_latest_block_number().await?;
        info!(
            network = %self.network,
            "ChainClient is connected to chain {chain_id}, bridge {:?}, current block number: {block_number}",
            self.inner.bridge_address(),
        );
        Ok(())
    }

    pub async fn get_chain_id(&self) -> BridgeResult<u64> {
        let result = self.read("get_chain_id", || self.inner.get_chain_id()).await;
        self.observe("get_chain_id", result)
    }

    pub async fn get_latest_block_number(&self) -> BridgeResult<u64> {
        let result = self
            .read("get_latest_block_number", || {
                self.inner.get_latest_block_number()
            })
            .await;
        self.observe("get_latest_block_number", result)
    }

    // Highest block considered final: head minus confirmation depth. None
    // while the chain is shorter than the confirmation depth.
    pub async fn latest_safe_block(&self) -> BridgeResult<Option<u64>> {
        let head = self.get_latest_block_number().await?;
        let safe = head.checked_sub(self.confirmation_depth);
        if let Some(safe) = safe {
            self.bridge_metrics
                .latest_safe_block
                .with_label_values(&[self.network.as_str()])
                .set(safe as i64);
        }
        Ok(safe)
    }

    // Deposit events in `[from_block, to_block]`, ascending by (block, log index).
    pub async fn get_deposit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<DepositEvent>> {
        if from_block > to_block {
            return Ok(vec![]);
        }
        let result = self
            .read("get_deposit_events", || {
                self.inner.get_deposit_events(from_block, to_block)
            })
            .await;
        let mut events = self.observe("get_deposit_events", result)?;
        events.sort_by_key(|e| e.position());
        Ok(events)
    }

    pub async fn is_token_registered(&self, token_id: TokenId) -> BridgeResult<bool> {
        let result = self
            .read("is_token_registered", || {
                self.inner.is_token_registered(token_id)
            })
            .await;
        self.observe("is_token_registered", result)
    }

    // Not retried here: the relay decides what a failed submission means.
    pub async fn submit_withdrawal(&self, auth: &SignedAuthorization) -> BridgeResult<TxHash> {
        let result = self.inner.submit_withdrawal(auth).await;
        self.observe("submit_withdrawal", result)
    }

    pub async fn get_withdrawal_status(
        &self,
        transfer_id: TransferId,
    ) -> BridgeResult<WithdrawalStatus> {
        let result = self
            .read("get_withdrawal_status", || {
                self.inner.get_withdrawal_status(transfer_id)
            })
            .await;
        self.observe("get_withdrawal_status", result)
    }

    pub async fn get_submission_status(&self, tx_hash: TxHash) -> BridgeResult<SubmissionStatus> {
        let result = self
            .read("get_submission_status", || {
                self.inner.get_submission_status(tx_hash)
            })
            .await;
        self.observe("get_submission_status", result)
    }

    async fn read<T, F, Fut>(&self, method: &str, f: F) -> BridgeResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BridgeResult<T>>,
    {
        if self.rpc_retry_max_elapsed.is_zero() {
            return f().await;
        }
        match retry_with_max_elapsed_time!(f(), self.rpc_retry_max_elapsed) {
            Ok(result) => result,
            Err(e) => {
                warn!(network = %self.network, "{method} still failing after retries: {e}");
                Err(e)
            }
        }
    }

    fn observe<T>(&self, method: &str, result: BridgeResult<T>) -> BridgeResult<T> {
        if let Err(BridgeError::RpcError(_)) = &result {
            self.bridge_metrics
                .rpc_errors
                .with_label_values(&[self.network.as_str(), method])
                .inc();
        }
        result
    }
}
