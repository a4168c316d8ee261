// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::{ChainClient, ChainClientInner};
use crate::config::{BridgeNodeConfig, RelayPlan};
use crate::crypto::BridgeSigner;
use crate::error::BridgeResult;
use crate::metrics::BridgeMetrics;
use crate::relay::{RelayConfig, RelayEngine, RelayJob};
use crate::scheduler::{JobStates, Scheduler};
use crate::server::{handler::BridgeRequestHandler, run_server};
use crate::status::{HealthCheckJob, StatusRegistry};
use crate::storage::BridgeLedgerTables;
use crate::types::Direction;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub async fn run_bridge_node(
    config: BridgeNodeConfig,
    prometheus_registry: prometheus::Registry,
) -> anyhow::Result<BridgeNodeHandle> {
    let metrics = Arc::new(BridgeMetrics::new(&prometheus_registry));
    let runtime = config.validate(metrics.clone()).await?;
    let store = BridgeLedgerTables::new(&runtime.db_path)?;
    start_relay_node(RelayNodeComponents {
        client_a: runtime.client_a,
        client_b: runtime.client_b,
        store,
        signer: runtime.key,
        plan: runtime.plan,
        server_address: SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            runtime.server_listen_port,
        ),
        metrics,
    })
    .await
}

pub struct RelayNodeComponents<A, B> {
    pub client_a: Arc<ChainClient<A>>,
    pub client_b: Arc<ChainClient<B>>,
    pub store: Arc<BridgeLedgerTables>,
    pub signer: Arc<dyn BridgeSigner>,
    pub plan: RelayPlan,
    pub server_address: SocketAddr,
    pub metrics: Arc<BridgeMetrics>,
}

pub struct BridgeNodeHandle {
    scheduler: Scheduler,
    status: Arc<StatusRegistry>,
    server_address: SocketAddr,
    server_handle: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl BridgeNodeHandle {
    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    pub fn job_states(&self) -> JobStates {
        self.scheduler.job_states()
    }

    /// Stops ticking, waits for running cycles up to the shutdown timeout and
    /// closes the status server. Returns false if cycles were abandoned.
    pub async fn stop(mut self) -> bool {
        info!("Stopping bridge node");
        let drained = self.scheduler.stop(self.shutdown_timeout).await;
        self.server_handle.abort();
        drained
    }
}

/// Wires both relay directions and the health check into a scheduler, starts
/// the status server and then the scheduler.
pub async fn start_relay_node<A, B>(
    components: RelayNodeComponents<A, B>,
) -> anyhow::Result<BridgeNodeHandle>
where
    A: ChainClientInner + 'static,
    B: ChainClientInner + 'static,
{
    let RelayNodeComponents {
        client_a,
        client_b,
        store,
        signer,
        plan,
        server_address,
        metrics,
    } = components;
    let status = Arc::new(StatusRegistry::new(store.clone(), metrics.clone()));

    let a_to_b = Arc::new(RelayEngine::new(
        Direction::AToB,
        client_a.clone(),
        client_b.clone(),
        store.clone(),
        signer.clone(),
        resolve_relay_config(&store, Direction::AToB, &plan)?,
        metrics.clone(),
    ));
    let b_to_a = Arc::new(RelayEngine::new(
        Direction::BToA,
        client_b.clone(),
        client_a.clone(),
        store.clone(),
        signer,
        resolve_relay_config(&store, Direction::BToA, &plan)?,
        metrics.clone(),
    ));

    let mut scheduler = Scheduler::new(metrics);
    scheduler.add_job(
        Arc::new(RelayJob::new(a_to_b.clone(), status.clone())),
        plan.cadence.clone(),
    )?;
    scheduler.add_job(
        Arc::new(RelayJob::new(b_to_a.clone(), status.clone())),
        plan.cadence.clone(),
    )?;
    scheduler.add_job(
        Arc::new(HealthCheckJob::new(client_a, client_b, status.clone())),
        plan.health_check_cadence.clone(),
    )?;
    status.set_job_states(scheduler.job_states());

    let handler = BridgeRequestHandler::new(status.clone())
        .with_retrier(Direction::AToB, a_to_b)
        .with_retrier(Direction::BToA, b_to_a);
    let (server_address, server_handle) = run_server(&server_address, handler).await?;

    scheduler.start();
    info!(cadence = %plan.cadence, "Bridge node started");
    Ok(BridgeNodeHandle {
        scheduler,
        status,
        server_address,
        server_handle,
        shutdown_timeout: plan.shutdown_timeout,
    })
}

// Start position precedence: override > stored cursor > fallback.
// An override drops the stored cursor so the scan restarts at the override.
fn resolve_relay_config(
    store: &BridgeLedgerTables,
    direction: Direction,
    plan: &RelayPlan,
) -> BridgeResult<RelayConfig> {
    let direction_plan = plan.direction(direction);
    let mut relay = direction_plan.relay.clone();
    let stored = store.get_cursor(direction)?;
    match (direction_plan.start_block_override, stored) {
        (Some(override_), _) => {
            warn!(
                direction = direction.as_str(),
                "Overriding start block to {override_}. Stored cursor: {stored:?}"
            );
            store.reset_cursor(direction, None)?;
            relay.start_block = override_;
        }
        (None, Some(cursor)) => {
            info!(direction = direction.as_str(), "Resuming from cursor {cursor}");
        }
        (None, None) => {
            info!(
                direction = direction.as_str(),
                "No cursor stored, starting from block {}", relay.start_block
            );
        }
    }
    Ok(relay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectionPlan;
    use crate::cron::Schedule;
    use crate::crypto::ValidatorKey;
    use crate::server::HealthResponse;
    use crate::telemetry::init_for_testing;
    use crate::test_utils::{new_mock_chain, test_amount};
    use crate::types::{EventPosition, NetworkId, TransferState, NATIVE_TOKEN_ID};
    use bridge_validator_config::local_ip_utils::localhost_for_testing;
    use ethers::types::Address as EthAddress;

    fn plan(override_a: Option<u64>, override_b: Option<u64>) -> RelayPlan {
        let direction_plan = |start_block_override| DirectionPlan {
            relay: RelayConfig {
                start_block: 10,
                retry_backoff_initial: Duration::ZERO,
                ..Default::default()
            },
            start_block_override,
        };
        RelayPlan {
            cadence: Schedule::every(Duration::from_millis(50)),
            health_check_cadence: Schedule::every(Duration::from_millis(100)),
            shutdown_timeout: Duration::from_secs(5),
            a_to_b: direction_plan(override_a),
            b_to_a: direction_plan(override_b),
        }
    }

    #[test]
    fn test_start_block_precedence() {
        init_for_testing();
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();

        // Nothing stored, no override: fallback
        let relay = resolve_relay_config(&store, Direction::AToB, &plan(None, None)).unwrap();
        assert_eq!(relay.start_block, 10);
        assert_eq!(store.get_cursor(Direction::AToB).unwrap(), None);

        // Stored cursor is kept and wins over the fallback
        store
            .update_cursor(Direction::AToB, EventPosition::end_of_block(100))
            .unwrap();
        resolve_relay_config(&store, Direction::AToB, &plan(None, None)).unwrap();
        assert_eq!(
            store.get_cursor(Direction::AToB).unwrap(),
            Some(EventPosition::end_of_block(100))
        );

        // Override wins over the stored cursor, of its own direction only
        store
            .update_cursor(Direction::BToA, EventPosition::new(7, 1))
            .unwrap();
        let relay = resolve_relay_config(&store, Direction::AToB, &plan(Some(420), None)).unwrap();
        assert_eq!(relay.start_block, 420);
        assert_eq!(store.get_cursor(Direction::AToB).unwrap(), None);
        let relay = resolve_relay_config(&store, Direction::BToA, &plan(Some(420), None)).unwrap();
        assert_eq!(relay.start_block, 10);
        assert_eq!(
            store.get_cursor(Direction::BToA).unwrap(),
            Some(EventPosition::new(7, 1))
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_relay_node() {
        init_for_testing();
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let key = Arc::new(ValidatorKey::random());
        let chain_a = new_mock_chain(NetworkId::A, key.address());
        let chain_b = new_mock_chain(NetworkId::B, key.address());
        chain_a.set_latest_block(10);
        chain_b.set_latest_block(10);

        let node = start_relay_node(RelayNodeComponents {
            client_a: Arc::new(ChainClient::new_for_testing(NetworkId::A, chain_a.clone())),
            client_b: Arc::new(ChainClient::new_for_testing(NetworkId::B, chain_b.clone())),
            store: store.clone(),
            signer: key,
            plan: plan(None, None),
            server_address: SocketAddr::new(localhost_for_testing(), 0),
            metrics: Arc::new(BridgeMetrics::new_for_testing()),
        })
        .await
        .unwrap();

        let account = EthAddress::random();
        let deposit = chain_a.deposit(
            NATIVE_TOKEN_ID,
            crate::crypto::get_random_transfer_id(account),
            account,
            test_amount(),
        );
        chain_a.mine_blocks(1);

        let mut completed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(transfer) = store.get_transfer(&deposit.transfer_id).unwrap() {
                if transfer.state == TransferState::Completed {
                    completed = true;
                    break;
                }
            }
        }
        assert!(completed, "deposit was not relayed");
        assert!(chain_b.is_executed(deposit.transfer_id));

        let health: HealthResponse =
            reqwest::get(format!("http://{}/health", node.server_address()))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert!(health.healthy, "{:?}", health.problems);
        let states = node.job_states().snapshot();
        let names: Vec<_> = states.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["health_check", "relay_a_to_b", "relay_b_to_a"]);

        assert!(node.stop().await);
        assert_eq!(chain_b.submission_attempts(deposit.transfer_id), 1);
    }
}
