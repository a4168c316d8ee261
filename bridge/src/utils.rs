// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::{BridgeNodeConfig, NetworkConfig, RelaySettings};
use crate::crypto::{BridgeSigner, ValidatorKey};
use anyhow::{anyhow, Context};
use bridge_validator_config::Config;
use ethers::signers::LocalWallet;
use ethers::types::Address as EthAddress;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// Generate a validator key (secp256k1) and write it to a file as hex encoded `privkey`.
pub fn generate_validator_key_and_write_to_file(path: &Path) -> anyhow::Result<EthAddress> {
    let wallet = LocalWallet::new(&mut rand::thread_rng());
    let encoded = hex::encode(wallet.signer().to_bytes());
    std::fs::write(path, encoded)
        .map_err(|err| anyhow!("Failed to write encoded key to path: {:?}", err))?;
    Ok(ValidatorKey::new(wallet).address())
}

pub fn read_validator_key(path: &Path) -> anyhow::Result<ValidatorKey> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read validator key from {}", path.display()))?;
    let contents = contents.trim();
    let hex_key = contents.strip_prefix("0x").unwrap_or(contents);
    ValidatorKey::from_hex(hex_key)
        .with_context(|| format!("Invalid validator key in {}", path.display()))
}

// Read the validator key from a file and return the address it signs for.
pub fn examine_key(path: &Path) -> anyhow::Result<EthAddress> {
    Ok(read_validator_key(path)?.address())
}

// Generate a node config template and write it to a file.
pub fn generate_bridge_node_config_and_write_to_file(path: &Path) -> anyhow::Result<()> {
    let network = |rpc_url: &str| NetworkConfig {
        rpc_url: rpc_url.to_string(),
        bridge_contract_address: "0x0000000000000000000000000000000000000000".to_string(),
        chain_id: None,
        confirmation_depth: 6,
        start_block_fallback: 0,
        start_block_override: None,
        max_block_range: 1000,
        poll_interval: Duration::from_millis(2000),
    };
    let config = BridgeNodeConfig {
        server_listen_port: 9191,
        metrics_port: 9184,
        validator_key_path: PathBuf::from("/path/to/your/validator_key"),
        db_path: PathBuf::from("/path/to/your/ledger_db"),
        network_a: network("your_network_a_rpc_url"),
        network_b: network("your_network_b_rpc_url"),
        relay: RelaySettings::default(),
        health_check_cadence: "@every 10s".parse()?,
        shutdown_timeout: Duration::from_secs(30),
    };
    config.persisted(path).save()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_read_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validator.key");
        let address = generate_validator_key_and_write_to_file(&path).unwrap();
        assert_eq!(examine_key(&path).unwrap(), address);

        // A 0x prefix and trailing newline are tolerated
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("0x{contents}\n")).unwrap();
        assert_eq!(read_validator_key(&path).unwrap().address(), address);

        std::fs::write(&path, "zz").unwrap();
        assert!(read_validator_key(&path).is_err());
        assert!(read_validator_key(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_config_template_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        generate_bridge_node_config_and_write_to_file(&path).unwrap();
        let config = BridgeNodeConfig::load(&path).unwrap();
        config.check().unwrap();
        assert_eq!(config.network_b.confirmation_depth, 6);
        assert_eq!(config.relay, RelaySettings::default());
    }

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let before = now_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(now_ms() > before);
    }
}
