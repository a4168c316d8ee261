// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::ChainClient;
use crate::crypto::{get_random_transfer_id, BridgeSigner, ValidatorKey};
use crate::metrics::BridgeMetrics;
use crate::mock_chain_client::MockChainClient;
use crate::relay::{RelayConfig, RelayEngine};
use crate::storage::BridgeLedgerTables;
use crate::types::{
    Amount, DepositEvent, Direction, NetworkId, Transfer, TransferId, NATIVE_TOKEN_ID,
};
use ethers::types::{Address as EthAddress, U256};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CHAIN_ID_A: u64 = 1;
pub const CHAIN_ID_B: u64 = 2;

pub type MockRelayEngine = RelayEngine<MockChainClient, MockChainClient>;

// 100,000 units of an 18 decimal coin.
pub fn test_amount() -> U256 {
    Amount::make(100_000, 18)
}

pub fn chain_id(network: NetworkId) -> u64 {
    match network {
        NetworkId::A => CHAIN_ID_A,
        NetworkId::B => CHAIN_ID_B,
    }
}

// A mock chain with the validator installed and native liquidity funded.
pub fn new_mock_chain(network: NetworkId, validator: EthAddress) -> MockChainClient {
    let mock = MockChainClient::new(chain_id(network));
    mock.set_validator(validator);
    mock.add_liquidity(NATIVE_TOKEN_ID, Amount::make(1_000_000, 18));
    mock
}

#[allow(clippy::too_many_arguments)]
pub fn mock_relay_engine(
    direction: Direction,
    source: &MockChainClient,
    dest: &MockChainClient,
    confirmation_depth: u64,
    store: Arc<BridgeLedgerTables>,
    signer: Arc<ValidatorKey>,
    config: RelayConfig,
    metrics: Arc<BridgeMetrics>,
) -> Arc<MockRelayEngine> {
    let source = ChainClient::new_for_testing(direction.source(), source.clone())
        .with_confirmation_depth(confirmation_depth);
    let dest = ChainClient::new_for_testing(direction.dest(), dest.clone());
    Arc::new(RelayEngine::new(
        direction,
        Arc::new(source),
        Arc::new(dest),
        store,
        signer,
        config,
        metrics,
    ))
}

/// One relay direction over two mock chains and a temporary store.
pub struct RelayTestEnv {
    pub direction: Direction,
    pub store: Arc<BridgeLedgerTables>,
    pub source: MockChainClient,
    pub dest: MockChainClient,
    pub key: Arc<ValidatorKey>,
    pub metrics: Arc<BridgeMetrics>,
    pub config: RelayConfig,
    pub engine: Arc<MockRelayEngine>,
    _temp_dir: TempDir,
}

impl RelayTestEnv {
    pub fn relay_config() -> RelayConfig {
        RelayConfig {
            max_block_range: 1000,
            max_submission_retries: 3,
            retry_backoff_initial: Duration::ZERO,
            retry_backoff_max: Duration::from_secs(60),
            start_block: 0,
        }
    }

    pub fn new(direction: Direction) -> Self {
        Self::with_config(direction, Self::relay_config())
    }

    pub fn with_config(direction: Direction, config: RelayConfig) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let key = Arc::new(ValidatorKey::random());
        let source = new_mock_chain(direction.source(), key.address());
        let dest = new_mock_chain(direction.dest(), key.address());
        let metrics = Arc::new(BridgeMetrics::new_for_testing());
        let engine = mock_relay_engine(
            direction,
            &source,
            &dest,
            0,
            store.clone(),
            key.clone(),
            config.clone(),
            metrics.clone(),
        );
        Self {
            direction,
            store,
            source,
            dest,
            key,
            metrics,
            config,
            engine,
            _temp_dir: temp_dir,
        }
    }

    // A new engine over the same chains and store, as after a restart.
    pub fn engine_with_confirmation_depth(&self, confirmation_depth: u64) -> Arc<MockRelayEngine> {
        mock_relay_engine(
            self.direction,
            &self.source,
            &self.dest,
            confirmation_depth,
            self.store.clone(),
            self.key.clone(),
            self.config.clone(),
            self.metrics.clone(),
        )
    }

    pub fn restarted_engine(&self) -> Arc<MockRelayEngine> {
        self.engine_with_confirmation_depth(0)
    }

    pub fn random_transfer_id(&self) -> TransferId {
        get_random_transfer_id(EthAddress::random())
    }

    // Native deposit in the head block, which is then buried by one block.
    pub fn deposit_native(&self, amount: U256) -> DepositEvent {
        let event = self.deposit_native_unmined(amount);
        self.source.mine_blocks(1);
        event
    }

    pub fn deposit_native_unmined(&self, amount: U256) -> DepositEvent {
        let account = EthAddress::random();
        self.source.deposit(
            NATIVE_TOKEN_ID,
            get_random_transfer_id(account),
            account,
            amount,
        )
    }

    pub fn transfer(&self, transfer_id: TransferId) -> Transfer {
        self.store
            .get_transfer(&transfer_id)
            .unwrap()
            .expect("transfer should be recorded")
    }
}
