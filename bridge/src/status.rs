// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operational view of the node: where each direction's cursor is, how far
//! behind the safe head it runs, what went wrong last, and how many transfers
//! sit in each state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain_client::{ChainClient, ChainClientInner};
use crate::error::BridgeResult;
use crate::metrics::BridgeMetrics;
use crate::relay::CycleSummary;
use crate::scheduler::{Job, JobState, JobStates};
use crate::storage::BridgeLedgerTables;
use crate::types::{Direction, EventPosition, TransferState};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionStatus {
    pub cursor: Option<EventPosition>,
    pub latest_safe_block: Option<u64>,
    // Blocks between the cursor and the latest safe block.
    pub lag_blocks: Option<u64>,
    pub last_cycle: Option<CycleSummary>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ok: Option<bool>,
    pub last_error: Option<String>,
    pub consecutive_failures: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectionReport {
    pub direction: Direction,
    #[serde(flatten)]
    pub status: DirectionStatus,
    pub transfers: BTreeMap<TransferState, u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub healthy: bool,
    pub problems: Vec<String>,
    pub directions: Vec<DirectionReport>,
    pub jobs: Vec<JobState>,
}

pub struct StatusRegistry {
    store: Arc<BridgeLedgerTables>,
    metrics: Arc<BridgeMetrics>,
    directions: RwLock<BTreeMap<Direction, DirectionStatus>>,
    jobs: RwLock<JobStates>,
}

fn lag(cursor: Option<EventPosition>, latest_safe_block: u64) -> u64 {
    match cursor {
        Some(position) => latest_safe_block.saturating_sub(position.block),
        None => latest_safe_block,
    }
}

impl StatusRegistry {
    pub fn new(store: Arc<BridgeLedgerTables>, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            store,
            metrics,
            directions: RwLock::new(
                Direction::ALL
                    .into_iter()
                    .map(|d| (d, DirectionStatus::default()))
                    .collect(),
            ),
            jobs: RwLock::new(JobStates::default()),
        }
    }

    pub fn store(&self) -> &Arc<BridgeLedgerTables> {
        &self.store
    }

    pub fn set_job_states(&self, jobs: JobStates) {
        *self.jobs.write() = jobs;
    }

    pub fn record_cycle(&self, direction: Direction, result: &BridgeResult<CycleSummary>) {
        let mut directions = self.directions.write();
        let status = directions.entry(direction).or_default();
        status.last_cycle_at = Some(Utc::now());
        match result {
            Ok(summary) => {
                status.last_cycle_ok = Some(true);
                status.consecutive_failures = 0;
                status.cursor = summary.cursor;
                status.latest_safe_block = summary.latest_safe_block;
                status.lag_blocks = summary
                    .latest_safe_block
                    .map(|safe| lag(summary.cursor, safe));
                status.last_cycle = Some(summary.clone());
            }
            Err(e) => {
                status.last_cycle_ok = Some(false);
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
            }
        }
    }

    // Refreshes head and lag between cycles. The cursor comes from the store
    // since a cycle may have moved it since the last report.
    pub fn record_safe_block(&self, direction: Direction, latest_safe_block: u64) -> BridgeResult<()> {
        let cursor = self.store.get_cursor(direction)?;
        let lag_blocks = lag(cursor, latest_safe_block);
        self.metrics
            .processing_lag
            .with_label_values(&[direction.as_str()])
            .set(lag_blocks as i64);
        let mut directions = self.directions.write();
        let status = directions.entry(direction).or_default();
        status.cursor = cursor;
        status.latest_safe_block = Some(latest_safe_block);
        status.lag_blocks = Some(lag_blocks);
        Ok(())
    }

    pub fn direction_status(&self, direction: Direction) -> DirectionStatus {
        self.directions
            .read()
            .get(&direction)
            .cloned()
            .unwrap_or_default()
    }

    /// Unhealthy when a job stopped ticking or a direction's last cycle failed.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = vec![];
        for state in self.jobs.read().snapshot() {
            if state.stopped {
                problems.push(format!(
                    "job {} stopped: {}",
                    state.name,
                    state.last_error.as_deref().unwrap_or("shut down")
                ));
            }
        }
        for (direction, status) in self.directions.read().iter() {
            if status.last_cycle_ok == Some(false) {
                problems.push(format!(
                    "last {direction} cycle failed: {}",
                    status.last_error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        problems
    }

    pub fn is_healthy(&self) -> bool {
        self.problems().is_empty()
    }

    pub fn snapshot(&self) -> BridgeResult<NodeStatus> {
        let mut directions = vec![];
        for direction in Direction::ALL {
            directions.push(DirectionReport {
                direction,
                status: self.direction_status(direction),
                transfers: self.store.count_by_state(direction)?,
            });
        }
        let problems = self.problems();
        Ok(NodeStatus {
            healthy: problems.is_empty(),
            problems,
            directions,
            jobs: self.jobs.read().snapshot(),
        })
    }
}

// Polls both chain heads so lag stays current while a direction is idle,
// and refreshes the per-state transfer gauges.
pub struct HealthCheckJob<A, B> {
    client_a: Arc<ChainClient<A>>,
    client_b: Arc<ChainClient<B>>,
    status: Arc<StatusRegistry>,
}

impl<A, B> HealthCheckJob<A, B>
where
    A: ChainClientInner,
    B: ChainClientInner,
{
    pub fn new(
        client_a: Arc<ChainClient<A>>,
        client_b: Arc<ChainClient<B>>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            client_a,
            client_b,
            status,
        }
    }
}

#[async_trait]
impl<A, B> Job for HealthCheckJob<A, B>
where
    A: ChainClientInner + 'static,
    B: ChainClientInner + 'static,
{
    fn name(&self) -> &str {
        "health_check"
    }

    async fn run(&self, _shutdown: CancellationToken) -> BridgeResult<()> {
        let (safe_a, safe_b) = tokio::try_join!(
            self.client_a.latest_safe_block(),
            self.client_b.latest_safe_block()
        )?;
        for (network, safe) in [
            (self.client_a.network(), safe_a),
            (self.client_b.network(), safe_b),
        ] {
            if let Some(safe) = safe {
                self.status
                    .record_safe_block(Direction::from_source(network), safe)?;
            }
        }
        for direction in Direction::ALL {
            let counts = self.status.store.count_by_state(direction)?;
            for state in TransferState::ALL {
                self.status
                    .metrics
                    .transfers_by_state
                    .with_label_values(&[direction.as_str(), state.as_str()])
                    .set(counts.get(&state).copied().unwrap_or_default() as i64);
            }
        }
        debug!(?safe_a, ?safe_b, "Health check done");
        Ok(())
    }
}
