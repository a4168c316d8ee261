// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::anyhow;
use bridge_validator::server::{ErrorResponse, RETRY_TRANSFER_PATH, STATUS_PATH};
use bridge_validator::status::NodeStatus;
use bridge_validator::types::{Transfer, TransferId};
use clap::*;
use ethers::types::Address as EthAddress;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
pub struct Args {
    #[clap(subcommand)]
    pub command: BridgeCommand,
}

#[derive(Parser, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
pub enum BridgeCommand {
    #[clap(name = "create-validator-key")]
    CreateValidatorKey { path: PathBuf },
    #[clap(name = "examine-key")]
    ExamineKey { path: PathBuf },
    #[clap(name = "create-node-config-template")]
    CreateNodeConfigTemplate { path: PathBuf },
    /// Transfer id a depositor derives from its beneficiary and a 32 byte salt
    #[clap(name = "compute-transfer-id")]
    ComputeTransferId {
        #[clap(long)]
        account: EthAddress,
        #[clap(long)]
        salt: String,
    },
    #[clap(name = "compute-token-id")]
    ComputeTokenId {
        #[clap(long)]
        name: String,
        #[clap(long)]
        symbol: String,
    },
    /// Print the relay status of a running node
    #[clap(name = "status")]
    Status {
        #[clap(long)]
        url: String,
    },
    /// Ask a running node to retry a failed transfer
    #[clap(name = "retry")]
    Retry {
        #[clap(long)]
        url: String,
        #[clap(long = "transfer-id")]
        transfer_id: TransferId,
    },
}

pub fn parse_salt(salt: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(salt.trim_start_matches("0x"))
        .map_err(|e| anyhow!("Salt is not valid hex: {e}"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("Salt must be 32 bytes, got {}", bytes.len()))
}

/// Thin client of the node's status server.
pub struct BridgeNodeClient {
    base_url: String,
    client: reqwest::Client,
}

impl BridgeNodeClient {
    pub fn new(url: &str) -> Self {
        Self {
            base_url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn status(&self) -> anyhow::Result<NodeStatus> {
        let response = self
            .client
            .get(format!("{}{STATUS_PATH}", self.base_url))
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn retry(&self, transfer_id: TransferId) -> anyhow::Result<Transfer> {
        let path = RETRY_TRANSFER_PATH.replace(":transfer_id", &format!("{transfer_id:?}"));
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await?;
        match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(e) => Err(anyhow!("Node returned {status} ({}): {}", e.kind, e.error)),
            Err(_) => Err(anyhow!("Node returned {status}: {body}")),
        }
    }
}

impl FromStr for BridgeNodeClient {
    type Err = anyhow::Error;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(anyhow!("Node url must start with http:// or https://, got {url}"));
        }
        Ok(Self::new(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_validator::metrics::BridgeMetrics;
    use bridge_validator::server::{handler::BridgeRequestHandler, run_server};
    use bridge_validator::status::StatusRegistry;
    use bridge_validator::storage::BridgeLedgerTables;
    use bridge_validator_config::local_ip_utils::localhost_for_testing;
    use std::net::SocketAddr;
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        let args = Args::try_parse_from([
            "bridge-validator-cli",
            "retry",
            "--url",
            "http://127.0.0.1:9191",
            "--transfer-id",
            "0x0707070707070707070707070707070707070707070707070707070707070707",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            BridgeCommand::Retry {
                url: "http://127.0.0.1:9191".into(),
                transfer_id: TransferId::repeat_byte(7),
            }
        );

        let args = Args::try_parse_from([
            "bridge-validator-cli",
            "compute-token-id",
            "--name",
            "Tether USD",
            "--symbol",
            "USDT",
        ])
        .unwrap();
        assert!(matches!(args.command, BridgeCommand::ComputeTokenId { .. }));

        assert!(Args::try_parse_from(["bridge-validator-cli", "status"]).is_err());
    }

    #[test]
    fn test_parse_salt() {
        assert_eq!(parse_salt(&format!("0x{}", "ab".repeat(32))).unwrap(), [0xab; 32]);
        assert!(parse_salt("abcd").unwrap_err().to_string().contains("32 bytes"));
        assert!(parse_salt("zz").is_err());
    }

    #[tokio::test]
    async fn test_node_client() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let status = Arc::new(StatusRegistry::new(
            store,
            Arc::new(BridgeMetrics::new_for_testing()),
        ));
        let (addr, _handle) = run_server(
            &SocketAddr::new(localhost_for_testing(), 0),
            BridgeRequestHandler::new(status),
        )
        .await
        .unwrap();

        let client = BridgeNodeClient::from_str(&format!("http://{addr}/")).unwrap();
        let node_status = client.status().await.unwrap();
        assert!(node_status.healthy);
        assert_eq!(node_status.directions.len(), 2);

        let err = client.retry(TransferId::repeat_byte(1)).await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
        assert!(err.to_string().contains("not found"), "{err}");

        assert!(BridgeNodeClient::from_str("127.0.0.1:9191").is_err());
    }
}
