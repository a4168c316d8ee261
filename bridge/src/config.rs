// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_client::ChainClient;
use crate::cron::Schedule;
use crate::crypto::{BridgeSigner, ValidatorKey};
use crate::eth_chain_client::EthChainClient;
use crate::metrics::BridgeMetrics;
use crate::relay::RelayConfig;
use crate::types::{Direction, NetworkId};
use crate::utils::read_validator_key;
use anyhow::anyhow;
use bridge_validator_config::Config;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn default_confirmation_depth() -> u64 {
    6
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_relay_cadence() -> Schedule {
    Schedule::every(Duration::from_secs(1))
}

fn default_health_check_cadence() -> Schedule {
    Schedule::every(Duration::from_secs(10))
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    // Rpc url of a full node of this network.
    pub rpc_url: String,
    // Address of the bridge contract on this network.
    pub bridge_contract_address: String,
    // Expected chain id. Validation fails if the node reports another one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    // Blocks that must be built on top of a deposit before it is relayed.
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    // First block scanned for deposits when no cursor is stored yet.
    // Usually the block the bridge contract was deployed in.
    #[serde(default)]
    pub start_block_fallback: u64,
    // Rescan deposits from this block regardless of the stored cursor.
    // Note: remove this after the node started once, otherwise every restart
    // rescans from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block_override: Option<u64>,
    // Blocks per event query.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RelaySettings {
    // How often each direction runs a relay cycle. A six field cron
    // expression with seconds (`*/1 * * * * *`) or `@every 500ms`.
    pub cadence: Schedule,
    // Resubmissions of a reverted or dropped withdrawal before the transfer fails.
    pub max_submission_retries: u32,
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "retry-backoff-initial-ms")]
    pub retry_backoff_initial: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(rename = "retry-backoff-max-ms")]
    pub retry_backoff_max: Duration,
    // How long a failing read is retried within a cycle before it is aborted.
    #[serde_as(as = "DurationSeconds")]
    #[serde(rename = "rpc-retry-max-elapsed-secs")]
    pub rpc_retry_max_elapsed: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            cadence: default_relay_cadence(),
            max_submission_retries: relay.max_submission_retries,
            retry_backoff_initial: relay.retry_backoff_initial,
            retry_backoff_max: relay.retry_backoff_max,
            rpc_retry_max_elapsed: Duration::from_secs(30),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BridgeNodeConfig {
    // The port that the status server listens on.
    pub server_listen_port: u16,
    // The port of the prometheus metrics server.
    pub metrics_port: u16,
    // File holding the hex encoded secp256k1 validator key. The same key
    // signs authorizations and pays for withdrawal transactions.
    pub validator_key_path: PathBuf,
    // Directory of the ledger store.
    pub db_path: PathBuf,
    pub network_a: NetworkConfig,
    pub network_b: NetworkConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default = "default_health_check_cadence")]
    pub health_check_cadence: Schedule,
    // Upper bound on waiting for running relay cycles at shutdown.
    #[serde_as(as = "DurationSeconds")]
    #[serde(rename = "shutdown-timeout-secs", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

impl Config for BridgeNodeConfig {}

// Everything the scheduler needs besides chain clients, store and key.
#[derive(Clone, Debug)]
pub struct RelayPlan {
    pub cadence: Schedule,
    pub health_check_cadence: Schedule,
    pub shutdown_timeout: Duration,
    pub a_to_b: DirectionPlan,
    pub b_to_a: DirectionPlan,
}

#[derive(Clone, Debug)]
pub struct DirectionPlan {
    pub relay: RelayConfig,
    pub start_block_override: Option<u64>,
}

impl RelayPlan {
    pub fn direction(&self, direction: Direction) -> &DirectionPlan {
        match direction {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        }
    }
}

pub struct BridgeNodeRuntimeConfig {
    pub key: Arc<ValidatorKey>,
    pub server_listen_port: u16,
    pub metrics_port: u16,
    pub db_path: PathBuf,
    pub client_a: Arc<ChainClient<EthChainClient>>,
    pub client_b: Arc<ChainClient<EthChainClient>>,
    pub plan: RelayPlan,
}

impl BridgeNodeConfig {
    pub fn network(&self, network: NetworkId) -> &NetworkConfig {
        match network {
            NetworkId::A => &self.network_a,
            NetworkId::B => &self.network_b,
        }
    }

    // Checks that don't need the network.
    pub fn check(&self) -> anyhow::Result<()> {
        for network in [NetworkId::A, NetworkId::B] {
            let config = self.network(network);
            EthAddress::from_str(&config.bridge_contract_address).map_err(|e| {
                anyhow!(
                    "Invalid bridge contract address {:?} for {network}: {e}",
                    config.bridge_contract_address
                )
            })?;
            if config.max_block_range == 0 {
                anyhow::bail!("max-block-range of {network} must be positive");
            }
        }
        if let (Some(a), Some(b)) = (self.network_a.chain_id, self.network_b.chain_id) {
            if a == b {
                anyhow::bail!("Both networks are configured with chain id {a}");
            }
        }
        if self.relay.retry_backoff_initial > self.relay.retry_backoff_max {
            anyhow::bail!("retry-backoff-initial-ms exceeds retry-backoff-max-ms");
        }
        Ok(())
    }

    pub fn relay_plan(&self) -> RelayPlan {
        let direction_plan = |direction: Direction| {
            let source = self.network(direction.source());
            DirectionPlan {
                relay: RelayConfig {
                    max_block_range: source.max_block_range,
                    max_submission_retries: self.relay.max_submission_retries,
                    retry_backoff_initial: self.relay.retry_backoff_initial,
                    retry_backoff_max: self.relay.retry_backoff_max,
                    start_block: source.start_block_fallback,
                },
                start_block_override: source.start_block_override,
            }
        };
        RelayPlan {
            cadence: self.relay.cadence.clone(),
            health_check_cadence: self.health_check_cadence.clone(),
            shutdown_timeout: self.shutdown_timeout,
            a_to_b: direction_plan(Direction::AToB),
            b_to_a: direction_plan(Direction::BToA),
        }
    }

    pub async fn validate(&self, metrics: Arc<BridgeMetrics>) -> anyhow::Result<BridgeNodeRuntimeConfig> {
        info!("Starting config validation");
        self.check()?;
        let key = Arc::new(read_validator_key(&self.validator_key_path)?);
        info!(
            "Loaded validator key {:?} from {:?}",
            key.address(),
            self.validator_key_path
        );
        let client_a = self.prepare_network(NetworkId::A, &key, metrics.clone()).await?;
        let client_b = self.prepare_network(NetworkId::B, &key, metrics).await?;
        let (chain_a, chain_b) = (client_a.get_chain_id().await?, client_b.get_chain_id().await?);
        if chain_a == chain_b {
            anyhow::bail!("network-a and network-b are the same chain ({chain_a})");
        }
        info!("Config validation complete");
        Ok(BridgeNodeRuntimeConfig {
            key,
            server_listen_port: self.server_listen_port,
            metrics_port: self.metrics_port,
            db_path: self.db_path.clone(),
            client_a,
            client_b,
            plan: self.relay_plan(),
        })
    }

    async fn prepare_network(
        &self,
        network: NetworkId,
        key: &ValidatorKey,
        metrics: Arc<BridgeMetrics>,
    ) -> anyhow::Result<Arc<ChainClient<EthChainClient>>> {
        let config = self.network(network);
        let bridge_address = EthAddress::from_str(&config.bridge_contract_address)?;
        let inner = EthChainClient::new(&config.rpc_url, bridge_address, key, config.poll_interval)
            .await?;
        let client = ChainClient::new(
            network,
            inner,
            config.confirmation_depth,
            self.relay.rpc_retry_max_elapsed,
            metrics,
        );
        let chain_id = client
            .get_chain_id()
            .await
            .map_err(|e| anyhow!("Error getting chain id of {network}: {e}"))?;
        if let Some(expected) = config.chain_id {
            if expected != chain_id {
                anyhow::bail!(
                    "Chain id mismatch on {network}: expected {expected}, but connected to {chain_id}"
                );
            }
        }
        client
            .describe()
            .await
            .map_err(|e| anyhow!("Error describing {network}: {e}"))?;
        Ok(Arc::new(client))
    }
}
