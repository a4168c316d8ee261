// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bridge_validator::config::BridgeNodeConfig;
use bridge_validator::metrics::start_prometheus_server;
use bridge_validator::node::run_bridge_node;
use bridge_validator::telemetry::TelemetryConfig;
use bridge_validator_config::Config;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bridge-validator-node", rename_all = "kebab-case")]
#[clap(version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = BridgeNodeConfig::load(&args.config_path)?;

    TelemetryConfig::new().with_env().init()?;
    info!("Starting bridge validator node with config {:?}", args.config_path);

    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let registry = prometheus::Registry::new();
    let _metrics_server = start_prometheus_server(metrics_address, registry.clone());

    let node = run_bridge_node(config, registry).await?;
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    if !node.stop().await {
        warn!("Some relay cycles did not finish before the shutdown timeout");
    }
    Ok(())
}
