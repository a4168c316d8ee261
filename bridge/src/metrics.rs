// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10., 20., 30., 60., 90., 120.,
];

pub const METRICS_ROUTE: &str = "/metrics";

#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    pub relay_cycles: IntCounterVec,
    pub relay_cycle_latency: HistogramVec,
    pub observed_deposits: IntCounterVec,
    pub authorized_transfers: IntCounterVec,
    pub submitted_withdrawals: IntCounterVec,
    pub completed_transfers: IntCounterVec,
    pub failed_transfers: IntCounterVec,
    pub resubmissions: IntCounterVec,
    pub stale_state_skips: IntCounterVec,
    pub rpc_errors: IntCounterVec,
    pub cursor_block: IntGaugeVec,
    pub latest_safe_block: IntGaugeVec,
    pub processing_lag: IntGaugeVec,
    pub transfers_by_state: IntGaugeVec,
    pub scheduler_invocations: IntCounterVec,
    pub scheduler_dropped_ticks: IntCounterVec,
    pub scheduler_job_errors: IntCounterVec,
    pub alerts: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            relay_cycles: register_int_counter_vec_with_registry!(
                "bridge_relay_cycles",
                "Total relay cycles by direction and outcome",
                &["direction", "outcome"],
                registry,
            )
            .unwrap(),
            relay_cycle_latency: register_histogram_vec_with_registry!(
                "bridge_relay_cycle_latency",
                "Wall time of one relay cycle in seconds",
                &["direction"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            observed_deposits: register_int_counter_vec_with_registry!(
                "bridge_observed_deposits",
                "Deposit events recorded for the first time",
                &["direction"],
                registry,
            )
            .unwrap(),
            authorized_transfers: register_int_counter_vec_with_registry!(
                "bridge_authorized_transfers",
                "Withdrawal authorizations signed by this validator",
                &["direction"],
                registry,
            )
            .unwrap(),
            submitted_withdrawals: register_int_counter_vec_with_registry!(
                "bridge_submitted_withdrawals",
                "Withdrawal transactions sent to the destination chain",
                &["direction"],
                registry,
            )
            .unwrap(),
            completed_transfers: register_int_counter_vec_with_registry!(
                "bridge_completed_transfers",
                "Transfers whose withdrawal was executed on the destination chain",
                &["direction"],
                registry,
            )
            .unwrap(),
            failed_transfers: register_int_counter_vec_with_registry!(
                "bridge_failed_transfers",
                "Transfers moved to Failed, by reason",
                &["direction", "reason"],
                registry,
            )
            .unwrap(),
            resubmissions: register_int_counter_vec_with_registry!(
                "bridge_withdrawal_resubmissions",
                "Withdrawals sent back to Authorized after a revert or drop",
                &["direction"],
                registry,
            )
            .unwrap(),
            stale_state_skips: register_int_counter_vec_with_registry!(
                "bridge_stale_state_skips",
                "Conditional transitions that lost against a concurrent writer",
                &["direction"],
                registry,
            )
            .unwrap(),
            rpc_errors: register_int_counter_vec_with_registry!(
                "bridge_rpc_errors",
                "RPC errors by network and method",
                &["network", "method"],
                registry,
            )
            .unwrap(),
            cursor_block: register_int_gauge_vec_with_registry!(
                "bridge_cursor_block",
                "Block height of the persisted cursor",
                &["direction"],
                registry,
            )
            .unwrap(),
            latest_safe_block: register_int_gauge_vec_with_registry!(
                "bridge_latest_safe_block",
                "Head minus confirmation depth",
                &["network"],
                registry,
            )
            .unwrap(),
            processing_lag: register_int_gauge_vec_with_registry!(
                "bridge_processing_lag_blocks",
                "Blocks between the cursor and the latest safe block",
                &["direction"],
                registry,
            )
            .unwrap(),
            transfers_by_state: register_int_gauge_vec_with_registry!(
                "bridge_transfers_by_state",
                "Number of ledger entries per state",
                &["direction", "state"],
                registry,
            )
            .unwrap(),
            scheduler_invocations: register_int_counter_vec_with_registry!(
                "bridge_scheduler_invocations",
                "Job invocations started by the scheduler",
                &["job"],
                registry,
            )
            .unwrap(),
            scheduler_dropped_ticks: register_int_counter_vec_with_registry!(
                "bridge_scheduler_dropped_ticks",
                "Ticks dropped because the previous invocation was still running",
                &["job"],
                registry,
            )
            .unwrap(),
            scheduler_job_errors: register_int_counter_vec_with_registry!(
                "bridge_scheduler_job_errors",
                "Job invocations that returned an error or panicked",
                &["job", "kind"],
                registry,
            )
            .unwrap(),
            alerts: register_int_counter_vec_with_registry!(
                "bridge_alerts",
                "Conditions that need operator attention",
                &["kind"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let metric_families = registry.gather();
    match TextEncoder.encode_to_string(&metric_families) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}

// Serves `registry` in the Prometheus text format on `address`.
pub fn start_prometheus_server(address: SocketAddr, registry: Registry) -> JoinHandle<()> {
    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics_handler))
        .with_state(registry);
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server on {address}: {e}");
                return;
            }
        };
        info!("Prometheus metrics server listening on {address}");
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server stopped: {e}");
        }
    })
}
