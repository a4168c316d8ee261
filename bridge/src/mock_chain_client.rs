// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! An in-memory bridge contract used in test environments.

use async_trait::async_trait;
use ethers::types::{Address as EthAddress, TxHash, H256, U256};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::chain_client::ChainClientInner;
use crate::crypto::verify_authorization;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    DepositEvent, SignedAuthorization, SubmissionStatus, TokenId, TransferId, WithdrawalStatus,
    NATIVE_TOKEN_ID,
};

#[derive(Debug, Default)]
struct MockChainState {
    latest_block: u64,
    next_log_index: u64,
    // Signer the contract accepts withdrawals from. Unset accepts any signer.
    validator: Option<EthAddress>,
    registered_tokens: HashSet<TokenId>,
    liquidity: HashMap<TokenId, U256>,
    deposits: Vec<DepositEvent>,
    executed: HashMap<TransferId, SignedAuthorization>,
    transactions: HashMap<TxHash, SubmissionStatus>,
    // Submissions accepted into the mempool but not yet mined.
    pending: Vec<(TxHash, SignedAuthorization)>,
    auto_mine: bool,
    failing_rpc_calls: u32,
    revert_next_submissions: u32,
    drop_next_submissions: u32,
    unreachable_submissions: u32,
    submission_attempts: HashMap<TransferId, u32>,
}

#[derive(Clone, Debug)]
pub struct MockChainClient {
    // does not change during tests so it does not need to be behind the lock
    chain_id: u64,
    bridge_address: EthAddress,
    state: Arc<Mutex<MockChainState>>,
}

impl MockChainClient {
    pub fn new(chain_id: u64) -> Self {
        let state = MockChainState {
            registered_tokens: HashSet::from([NATIVE_TOKEN_ID]),
            auto_mine: true,
            ..Default::default()
        };
        Self {
            chain_id,
            bridge_address: EthAddress::from_low_u64_be(0xb71d6e + chain_id),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_validator(&self, validator: EthAddress) {
        self.state.lock().validator = Some(validator);
    }

    pub fn register_token(&self, token_id: TokenId) {
        self.state.lock().registered_tokens.insert(token_id);
    }

    pub fn add_liquidity(&self, token_id: TokenId, amount: U256) {
        let mut state = self.state.lock();
        let entry = state.liquidity.entry(token_id).or_default();
        *entry = entry.saturating_add(amount);
    }

    pub fn liquidity(&self, token_id: TokenId) -> U256 {
        self.state
            .lock()
            .liquidity
            .get(&token_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn latest_block(&self) -> u64 {
        self.state.lock().latest_block
    }

    pub fn set_latest_block(&self, block: u64) {
        let mut state = self.state.lock();
        if block != state.latest_block {
            state.next_log_index = 0;
        }
        state.latest_block = block;
    }

    pub fn mine_blocks(&self, count: u64) {
        let mut state = self.state.lock();
        state.latest_block += count;
        state.next_log_index = 0;
    }

    // Locks `amount` in the contract and emits a deposit event in the head block.
    pub fn deposit(
        &self,
        token_id: TokenId,
        transfer_id: TransferId,
        account: EthAddress,
        amount: U256,
    ) -> DepositEvent {
        let mut state = self.state.lock();
        let log_index = state.next_log_index;
        state.next_log_index += 1;
        let event = DepositEvent {
            token_id,
            transfer_id,
            account,
            amount,
            block_number: state.latest_block,
            log_index,
            tx_hash: H256(keccak256(
                [transfer_id.as_bytes(), &log_index.to_be_bytes()[..]].concat(),
            )),
        };
        let entry = state.liquidity.entry(token_id).or_default();
        *entry = entry.saturating_add(amount);
        state.deposits.push(event.clone());
        event
    }

    // The next `count` RPC calls of any kind fail with `RpcError`.
    pub fn fail_next_rpc_calls(&self, count: u32) {
        self.state.lock().failing_rpc_calls = count;
    }

    // The next `count` accepted submissions are mined but revert.
    pub fn revert_next_submissions(&self, count: u32) {
        self.state.lock().revert_next_submissions = count;
    }

    // The next `count` accepted submissions vanish from the mempool.
    pub fn drop_next_submissions(&self, count: u32) {
        self.state.lock().drop_next_submissions = count;
    }

    // The next `count` submissions fail with `RpcError` before reaching the contract.
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().unreachable_submissions = count;
    }

    // With auto mining off, submissions stay pending until `mine_pending_submissions`.
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().auto_mine = auto_mine;
    }

    pub fn mine_pending_submissions(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        for (tx_hash, auth) in pending {
            Self::execute(&mut state, tx_hash, auth);
        }
    }

    pub fn is_executed(&self, transfer_id: TransferId) -> bool {
        self.state.lock().executed.contains_key(&transfer_id)
    }

    pub fn executed_count(&self) -> usize {
        self.state.lock().executed.len()
    }

    // Number of submissions the contract accepted for `transfer_id`.
    pub fn submission_attempts(&self, transfer_id: TransferId) -> u32 {
        self.state
            .lock()
            .submission_attempts
            .get(&transfer_id)
            .copied()
            .unwrap_or_default()
    }

    fn take_rpc_failure(&self, method: &str) -> BridgeResult<()> {
        let mut state = self.state.lock();
        if state.failing_rpc_calls > 0 {
            state.failing_rpc_calls -= 1;
            return Err(BridgeError::RpcError(format!(
                "mock chain {} unavailable: {method}",
                self.chain_id
            )));
        }
        Ok(())
    }

    fn execute(state: &mut MockChainState, tx_hash: TxHash, auth: SignedAuthorization) {
        // Checks repeated at execution time since another tx may have won the race.
        let available = state
            .liquidity
            .get(&auth.token_id)
            .copied()
            .unwrap_or_default();
        if state.executed.contains_key(&auth.transfer_id) || available < auth.amount {
            state.transactions.insert(tx_hash, SubmissionStatus::Reverted);
            return;
        }
        state
            .liquidity
            .insert(auth.token_id, available - auth.amount);
        state.executed.insert(auth.transfer_id, auth);
        state.transactions.insert(tx_hash, SubmissionStatus::Succeeded);
    }
}

#[async_trait]
impl ChainClientInner for MockChainClient {
    fn bridge_address(&self) -> EthAddress {
        self.bridge_address
    }

    async fn get_chain_id(&self) -> BridgeResult<u64> {
        self.take_rpc_failure("get_chain_id")?;
        Ok(self.chain_id)
    }

    async fn get_latest_block_number(&self) -> BridgeResult<u64> {
        self.take_rpc_failure("get_latest_block_number")?;
        Ok(self.state.lock().latest_block)
    }

    async fn get_deposit_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<DepositEvent>> {
        self.take_rpc_failure("get_deposit_events")?;
        Ok(self
            .state
            .lock()
            .deposits
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn is_token_registered(&self, token_id: TokenId) -> BridgeResult<bool> {
        self.take_rpc_failure("is_token_registered")?;
        Ok(self.state.lock().registered_tokens.contains(&token_id))
    }

    async fn submit_withdrawal(&self, auth: &SignedAuthorization) -> BridgeResult<TxHash> {
        // Suspends like a network round trip so concurrent cycles interleave.
        tokio::task::yield_now().await;
        self.take_rpc_failure("submit_withdrawal")?;
        {
            let mut state = self.state.lock();
            if state.unreachable_submissions > 0 {
                state.unreachable_submissions -= 1;
                return Err(BridgeError::RpcError(
                    "mock chain dropped the connection while sending".into(),
                ));
            }
        }
        // Simulates the contract checks that make gas estimation revert.
        let mut state = self.state.lock();
        if let Some(validator) = state.validator {
            verify_authorization(auth, validator).map_err(|e| {
                BridgeError::SubmissionError(format!(
                    "execution reverted: invalid validator signature: {e}"
                ))
            })?;
        }
        if !state.registered_tokens.contains(&auth.token_id) {
            return Err(BridgeError::SubmissionError(
                "execution reverted: token not registered".into(),
            ));
        }
        if state.executed.contains_key(&auth.transfer_id) {
            return Err(BridgeError::WithdrawalAlreadyExecuted);
        }
        let available = state
            .liquidity
            .get(&auth.token_id)
            .copied()
            .unwrap_or_default();
        if available < auth.amount {
            return Err(BridgeError::InsufficientLiquidity(format!(
                "available {available}, requested {}",
                auth.amount
            )));
        }

        let attempts = state.submission_attempts.entry(auth.transfer_id).or_default();
        *attempts += 1;
        let attempt = *attempts;
        let tx_hash = H256(keccak256(
            [auth.transfer_id.as_bytes(), &attempt.to_be_bytes()[..]].concat(),
        ));

        if state.drop_next_submissions > 0 {
            state.drop_next_submissions -= 1;
            return Ok(tx_hash);
        }
        if state.revert_next_submissions > 0 {
            state.revert_next_submissions -= 1;
            state.transactions.insert(tx_hash, SubmissionStatus::Reverted);
            return Ok(tx_hash);
        }
        if state.auto_mine {
            Self::execute(&mut state, tx_hash, auth.clone());
        } else {
            state.transactions.insert(tx_hash, SubmissionStatus::Pending);
            state.pending.push((tx_hash, auth.clone()));
        }
        Ok(tx_hash)
    }

    async fn get_withdrawal_status(
        &self,
        transfer_id: TransferId,
    ) -> BridgeResult<WithdrawalStatus> {
        self.take_rpc_failure("get_withdrawal_status")?;
        Ok(if self.state.lock().executed.contains_key(&transfer_id) {
            WithdrawalStatus::Executed
        } else {
            WithdrawalStatus::Pending
        })
    }

    async fn get_submission_status(&self, tx_hash: TxHash) -> BridgeResult<SubmissionStatus> {
        self.take_rpc_failure("get_submission_status")?;
        Ok(self
            .state
            .lock()
            .transactions
            .get(&tx_hash)
            .copied()
            .unwrap_or(SubmissionStatus::Dropped))
    }
}
