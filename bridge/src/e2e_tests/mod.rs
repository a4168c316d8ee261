// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Both relay directions driven by the real scheduler against two in-memory
//! chains sharing one validator key.

use crate::chain_client::ChainClient;
use crate::config::{DirectionPlan, RelayPlan};
use crate::cron::Schedule;
use crate::crypto::{get_random_transfer_id, get_token_id, BridgeSigner, ValidatorKey};
use crate::metrics::BridgeMetrics;
use crate::mock_chain_client::MockChainClient;
use crate::node::{start_relay_node, BridgeNodeHandle, RelayNodeComponents};
use crate::server::HealthResponse;
use crate::storage::BridgeLedgerTables;
use crate::telemetry::init_for_testing;
use crate::test_utils::new_mock_chain;
use crate::types::{
    Amount, DepositEvent, Direction, NetworkId, TokenId, Transfer, TransferState, NATIVE_TOKEN_ID,
};
use bridge_validator_config::local_ip_utils::localhost_for_testing;
use ethers::types::{Address as EthAddress, U256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestBridge {
    key: Arc<ValidatorKey>,
    chain_a: MockChainClient,
    chain_b: MockChainClient,
    store: Arc<BridgeLedgerTables>,
    confirmation_depth: u64,
    _temp_dir: TempDir,
}

impl TestBridge {
    fn new(confirmation_depth: u64) -> Self {
        init_for_testing();
        let temp_dir = tempfile::tempdir().unwrap();
        let key = Arc::new(ValidatorKey::random());
        let chain_a = new_mock_chain(NetworkId::A, key.address());
        let chain_b = new_mock_chain(NetworkId::B, key.address());
        Self {
            store: BridgeLedgerTables::new(temp_dir.path()).unwrap(),
            key,
            chain_a,
            chain_b,
            confirmation_depth,
            _temp_dir: temp_dir,
        }
    }

    fn chain(&self, network: NetworkId) -> &MockChainClient {
        match network {
            NetworkId::A => &self.chain_a,
            NetworkId::B => &self.chain_b,
        }
    }

    fn plan(&self) -> RelayPlan {
        let direction_plan = DirectionPlan {
            relay: crate::relay::RelayConfig {
                max_block_range: 5,
                max_submission_retries: 3,
                retry_backoff_initial: Duration::ZERO,
                retry_backoff_max: Duration::from_secs(1),
                start_block: 0,
            },
            start_block_override: None,
        };
        RelayPlan {
            cadence: Schedule::every(Duration::from_millis(50)),
            health_check_cadence: Schedule::every(Duration::from_millis(100)),
            shutdown_timeout: Duration::from_secs(5),
            a_to_b: direction_plan.clone(),
            b_to_a: direction_plan,
        }
    }

    async fn start_node(&self) -> BridgeNodeHandle {
        let client = |network, chain: &MockChainClient| {
            Arc::new(
                ChainClient::new_for_testing(network, chain.clone())
                    .with_confirmation_depth(self.confirmation_depth),
            )
        };
        start_relay_node(RelayNodeComponents {
            client_a: client(NetworkId::A, &self.chain_a),
            client_b: client(NetworkId::B, &self.chain_b),
            store: self.store.clone(),
            signer: self.key.clone(),
            plan: self.plan(),
            server_address: SocketAddr::new(localhost_for_testing(), 0),
            metrics: Arc::new(BridgeMetrics::new_for_testing()),
        })
        .await
        .unwrap()
    }

    // Registers `token` on both networks and funds both contracts with `liquidity`.
    fn register_token(&self, token: TokenId, liquidity: U256) {
        for chain in [&self.chain_a, &self.chain_b] {
            chain.register_token(token);
            chain.add_liquidity(token, liquidity);
        }
    }

    // Deposit into `source`, buried deep enough to be final.
    fn deposit(&self, source: NetworkId, token: TokenId, amount: U256) -> DepositEvent {
        let account = EthAddress::random();
        let chain = self.chain(source);
        let event = chain.deposit(token, get_random_transfer_id(account), account, amount);
        chain.mine_blocks(self.confirmation_depth + 1);
        event
    }

    fn transfer(&self, event: &DepositEvent) -> Option<Transfer> {
        self.store.get_transfer(&event.transfer_id).unwrap()
    }

    async fn wait_for_state(&self, events: &[DepositEvent], state: TransferState) {
        for _ in 0..200 {
            if events
                .iter()
                .all(|e| self.transfer(e).map(|t| t.state) == Some(state))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let states: Vec<_> = events
            .iter()
            .map(|e| self.transfer(e).map(|t| t.state))
            .collect();
        panic!("transfers did not reach {state}: {states:?}");
    }
}

async fn health(node: &BridgeNodeHandle) -> (reqwest::StatusCode, HealthResponse) {
    let response = reqwest::get(format!("http://{}/health", node.server_address()))
        .await
        .unwrap();
    (response.status(), response.json().await.unwrap())
}

#[tokio::test]
async fn test_native_transfer_a_to_b() {
    let bridge = TestBridge::new(6);
    let amount = Amount::make(100_000, 18);
    let liquidity_a = bridge.chain_a.liquidity(NATIVE_TOKEN_ID);
    let liquidity_b = bridge.chain_b.liquidity(NATIVE_TOKEN_ID);
    let node = bridge.start_node().await;

    let event = bridge.deposit(NetworkId::A, NATIVE_TOKEN_ID, amount);
    bridge
        .wait_for_state(&[event.clone()], TransferState::Completed)
        .await;

    let transfer = bridge.transfer(&event).unwrap();
    assert_eq!(transfer.source_network, NetworkId::A);
    assert_eq!(transfer.dest_network, NetworkId::B);
    assert_eq!(transfer.amount, amount);
    assert_eq!(transfer.account, event.account);
    assert_eq!(bridge.chain_a.liquidity(NATIVE_TOKEN_ID), liquidity_a + amount);
    assert_eq!(bridge.chain_b.liquidity(NATIVE_TOKEN_ID), liquidity_b - amount);
    assert_eq!(bridge.chain_b.executed_count(), 1);
    assert_eq!(bridge.chain_b.submission_attempts(event.transfer_id), 1);
    assert_eq!(bridge.chain_a.executed_count(), 0);

    let (code, body) = health(&node).await;
    assert_eq!(code, reqwest::StatusCode::OK, "{:?}", body.problems);
    assert!(node.stop().await);
}

#[tokio::test]
async fn test_token_transfers_both_directions() {
    let bridge = TestBridge::new(2);
    let usdt = get_token_id("Tether USD", "USDT");
    let wbtc = get_token_id("Wrapped BTC", "WBTC");
    bridge.register_token(usdt, Amount::make(1_000_000, 6));
    let node = bridge.start_node().await;

    let mut events = vec![];
    for i in 1..=3u64 {
        events.push(bridge.deposit(NetworkId::A, usdt, Amount::make(i * 1000, 6)));
        events.push(bridge.deposit(NetworkId::B, usdt, Amount::make(i * 10, 6)));
        events.push(bridge.deposit(NetworkId::B, NATIVE_TOKEN_ID, Amount::make(i, 18)));
    }
    // Not registered anywhere: quarantined, never submitted
    let unregistered = bridge.deposit(NetworkId::B, wbtc, Amount::make(1, 8));

    bridge.wait_for_state(&events, TransferState::Completed).await;
    bridge
        .wait_for_state(&[unregistered.clone()], TransferState::Failed)
        .await;

    assert_eq!(bridge.chain_b.executed_count(), 3);
    assert_eq!(bridge.chain_a.executed_count(), 6);
    assert!(!bridge.chain_a.is_executed(unregistered.transfer_id));
    assert_eq!(
        bridge.chain_b.liquidity(usdt),
        Amount::make(1_000_000 - 6000 + 60, 6)
    );
    assert_eq!(
        bridge.chain_a.liquidity(usdt),
        Amount::make(1_000_000 + 6000 - 60, 6)
    );

    let status = node.status().snapshot().unwrap();
    let b_to_a = status
        .directions
        .iter()
        .find(|d| d.direction == Direction::BToA)
        .unwrap();
    assert_eq!(b_to_a.transfers.get(&TransferState::Completed), Some(&6));
    assert_eq!(b_to_a.transfers.get(&TransferState::Failed), Some(&1));
    assert!(node.stop().await);
}

#[tokio::test]
async fn test_restart_resumes_without_duplicates() {
    let bridge = TestBridge::new(1);
    let node = bridge.start_node().await;
    let first: Vec<_> = (0..4)
        .map(|i| bridge.deposit(NetworkId::A, NATIVE_TOKEN_ID, Amount::make(i + 1, 18)))
        .collect();
    bridge.wait_for_state(&first, TransferState::Completed).await;
    assert!(node.stop().await);

    // Deposits made while the node is down
    let second: Vec<_> = (0..4)
        .map(|i| bridge.deposit(NetworkId::B, NATIVE_TOKEN_ID, Amount::make(i + 1, 18)))
        .chain((0..2).map(|_| bridge.deposit(NetworkId::A, NATIVE_TOKEN_ID, Amount::make(7, 18))))
        .collect();

    let node = bridge.start_node().await;
    bridge.wait_for_state(&second, TransferState::Completed).await;
    for event in first.iter().chain(&second) {
        let dest = bridge.chain(bridge.transfer(event).unwrap().dest_network);
        assert_eq!(dest.submission_attempts(event.transfer_id), 1);
    }
    assert_eq!(bridge.chain_b.executed_count(), 6);
    assert_eq!(bridge.chain_a.executed_count(), 4);
    assert!(node.stop().await);
}

#[tokio::test]
async fn test_rpc_outage_heals() {
    let bridge = TestBridge::new(0);
    let node = bridge.start_node().await;
    bridge.chain_b.fail_next_rpc_calls(u32::MAX);
    let event = bridge.deposit(NetworkId::A, NATIVE_TOKEN_ID, Amount::make(5, 18));

    let mut unhealthy = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if health(&node).await.0 == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            unhealthy = true;
            break;
        }
    }
    assert!(unhealthy, "outage was not reported");
    assert!(!bridge.chain_b.is_executed(event.transfer_id));

    bridge.chain_b.fail_next_rpc_calls(0);
    bridge
        .wait_for_state(&[event.clone()], TransferState::Completed)
        .await;
    assert_eq!(bridge.chain_b.submission_attempts(event.transfer_id), 1);

    // The next successful cycles clear the failure
    let mut healthy = false;
    for _ in 0..100 {
        if health(&node).await.0 == reqwest::StatusCode::OK {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(healthy);
    assert!(node.stop().await);
}
