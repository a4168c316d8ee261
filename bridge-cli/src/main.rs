// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bridge_validator::crypto::{get_token_id, get_transfer_id};
use bridge_validator::telemetry::TelemetryConfig;
use bridge_validator::utils::{
    examine_key, generate_bridge_node_config_and_write_to_file,
    generate_validator_key_and_write_to_file,
};
use bridge_validator_cli::{parse_salt, Args, BridgeCommand, BridgeNodeClient};
use clap::*;
use std::str::FromStr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    TelemetryConfig::new().with_env().init()?;
    let args = Args::parse();

    match args.command {
        BridgeCommand::CreateValidatorKey { path } => {
            let address = generate_validator_key_and_write_to_file(&path)?;
            println!(
                "Bridge validator key generated at {}, address {address:?}",
                path.display()
            );
        }
        BridgeCommand::ExamineKey { path } => {
            let address = examine_key(&path)?;
            println!("Validator address: {address:?}");
        }
        BridgeCommand::CreateNodeConfigTemplate { path } => {
            generate_bridge_node_config_and_write_to_file(&path)?;
            println!(
                "Bridge node config template generated at {}",
                path.display()
            );
        }
        BridgeCommand::ComputeTransferId { account, salt } => {
            let transfer_id = get_transfer_id(account, parse_salt(&salt)?);
            println!("{transfer_id:?}");
        }
        BridgeCommand::ComputeTokenId { name, symbol } => {
            println!("{:?}", get_token_id(&name, &symbol));
        }
        BridgeCommand::Status { url } => {
            let status = BridgeNodeClient::from_str(&url)?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        BridgeCommand::Retry { url, transfer_id } => {
            let transfer = BridgeNodeClient::from_str(&url)?.retry(transfer_id).await?;
            println!(
                "Transfer {:?} is now {}",
                transfer.transfer_id, transfer.state
            );
        }
    }
    Ok(())
}
