// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::types::{Address as EthAddress, TxHash};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::abi::{BridgeDepositedFilter, EthBridge};
use crate::chain_client::ChainClientInner;
use crate::crypto::ValidatorKey;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    DepositEvent, SignedAuthorization, SubmissionStatus, TokenId, TransferId, WithdrawalStatus,
};

type SigningProvider = SignerMiddleware<Provider<Http>, LocalWallet>;

// JSON-RPC client for an EVM network hosting the bridge contract.
pub struct EthChainClient {
    provider: Provider<Http>,
    bridge_address: EthAddress,
    reader: EthBridge<Provider<Http>>,
    writer: EthBridge<SigningProvider>,
}

impl EthChainClient {
    // Connects to `rpc_url` and binds the validator key to the node's chain id
    // for transaction signing.
    pub async fn new(
        rpc_url: &str,
        bridge_address: EthAddress,
        validator_key: &ValidatorKey,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Invalid rpc url {rpc_url}"))?
            .interval(poll_interval);
        let chain_id = provider
            .get_chainid()
            .await
            .with_context(|| format!("Can't establish connection with rpc {rpc_url}"))?
            .as_u64();
        let signer = SignerMiddleware::new(
            provider.clone(),
            validator_key.transaction_wallet(chain_id),
        );
        Ok(Self {
            reader: EthBridge::new(bridge_address, Arc::new(provider.clone())),
            writer: EthBridge::new(bridge_address, Arc::new(signer)),
            provider,
            bridge_address,
        })
    }
}

fn read_error<M: Middleware>(e: ContractError<M>) -> BridgeError {
    BridgeError::RpcError(e.to_string())
}

// Maps a rejected `executeWithdrawal` to the relay's error taxonomy.
fn classify_submission_error<M: Middleware>(e: ContractError<M>) -> BridgeError {
    let reason = e.decode_revert::<String>();
    let is_revert = e.is_revert() || reason.is_some();
    let message = reason.unwrap_or_else(|| e.to_string());
    classify_revert(&message, is_revert)
}

pub(crate) fn classify_revert(message: &str, is_revert: bool) -> BridgeError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("liquidity") || lower.contains("insufficient balance") {
        BridgeError::InsufficientLiquidity(message.to_string())
    } else if lower.contains("already") && (lower.contains("executed") || lower.contains("withdrawn"))
    {
        BridgeError::WithdrawalAlreadyExecuted
    } else if is_revert || lower.contains("revert") {
        BridgeError::SubmissionError(message.to_string())
    } else {
        BridgeError::RpcError(message.to_string())
    }
}

#[async_trait]
impl ChainClientInner for EthChainClient {
    fn bridge_address(&self) -> EthAddress {
        self.bridge_address
    }

    async fn get_chain_id(&self) -> BridgeResult<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }

    async fn get_latest_block_number(&self) -> BridgeResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn get_deposit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<DepositEvent>> {
        let events = self
            .reader
            .event::<BridgeDepositedFilter>()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(read_error)?;
        debug!(
            "Fetched {} deposit events in blocks [{from_block}, {to_block}]",
            events.len()
        );
        Ok(events.into_iter().map(DepositEvent::from).collect())
    }

    async fn is_token_registered(&self, token_id: TokenId) -> BridgeResult<bool> {
        self.reader
            .is_registered_token(token_id.0)
            .call()
            .await
            .map_err(read_error)
    }

    async fn submit_withdrawal(&self, auth: &SignedAuthorization) -> BridgeResult<TxHash> {
        let call = self.writer.execute_withdrawal(
            auth.token_id.0,
            auth.transfer_id.0,
            auth.account,
            auth.amount,
            auth.signature.clone(),
        );
        let pending = call.send().await.map_err(classify_submission_error)?;
        Ok(pending.tx_hash())
    }

    async fn get_withdrawal_status(
        &self,
        transfer_id: TransferId,
    ) -> BridgeResult<WithdrawalStatus> {
        let (_token_id, _account, _amount, executed) = self
            .reader
            .get_withdraw_info(transfer_id.0)
            .call()
            .await
            .map_err(read_error)?;
        Ok(if executed {
            WithdrawalStatus::Executed
        } else {
            WithdrawalStatus::Pending
        })
    }

    async fn get_submission_status(&self, tx_hash: TxHash) -> BridgeResult<SubmissionStatus> {
        if let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? {
            return Ok(match receipt.status.map(|s| s.as_u64()) {
                Some(1) => SubmissionStatus::Succeeded,
                Some(_) => SubmissionStatus::Reverted,
                None => {
                    warn!("Receipt of {tx_hash:?} carries no status, treating as succeeded");
                    SubmissionStatus::Succeeded
                }
            });
        }
        Ok(match self.provider.get_transaction(tx_hash).await? {
            Some(_) => SubmissionStatus::Pending,
            None => SubmissionStatus::Dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_revert() {
        assert!(matches!(
            classify_revert("E004: insufficient liquidity", true),
            BridgeError::InsufficientLiquidity(_)
        ));
        assert_eq!(
            classify_revert("withdrawal already executed", true),
            BridgeError::WithdrawalAlreadyExecuted
        );
        assert!(matches!(
            classify_revert("invalid signature", true),
            BridgeError::SubmissionError(_)
        ));
        assert!(matches!(
            classify_revert("(code: -32000, message: execution reverted, data: None)", false),
            BridgeError::SubmissionError(_)
        ));
        assert!(matches!(
            classify_revert("error sending request for url", false),
            BridgeError::RpcError(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_rpc_url() {
        let key = ValidatorKey::random();
        assert!(EthChainClient::new(
            "not a url",
            EthAddress::zero(),
            &key,
            Duration::from_millis(100)
        )
        .await
        .is_err());
    }
}
