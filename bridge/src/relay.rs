// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The relay engine moves deposits observed on one network to withdrawals on
//! the other. One engine serves one direction; the scheduler runs a cycle of
//! each engine per tick.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain_client::{ChainClient, ChainClientInner};
use crate::crypto::{sign_authorization, BridgeSigner};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::scheduler::Job;
use crate::status::StatusRegistry;
use crate::storage::BridgeLedgerTables;
use crate::types::{
    DepositEvent, Direction, EventPosition, SubmissionStatus, Transfer, TransferId, TransferState,
    WithdrawalStatus,
};
use crate::utils::now_ms;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    // Blocks fetched per event query.
    pub max_block_range: u64,
    // Resubmissions allowed after the first failed submission.
    pub max_submission_retries: u32,
    pub retry_backoff_initial: Duration,
    pub retry_backoff_max: Duration,
    // First block scanned when no cursor is stored yet.
    pub start_block: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_block_range: 1000,
            max_submission_retries: 5,
            retry_backoff_initial: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(600),
            start_block: 0,
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    // None while the source chain is shorter than its confirmation depth.
    pub latest_safe_block: Option<u64>,
    pub cursor: Option<EventPosition>,
    pub observed: u64,
    pub skipped: u64,
    pub authorized: u64,
    pub submitted: u64,
    pub requeued: u64,
    pub completed: u64,
    pub failed: u64,
    pub stale: u64,
    // Shutdown was requested before the cycle drained its work.
    pub interrupted: bool,
}

pub struct RelayEngine<S, D> {
    direction: Direction,
    source: Arc<ChainClient<S>>,
    dest: Arc<ChainClient<D>>,
    store: Arc<BridgeLedgerTables>,
    signer: Arc<dyn BridgeSigner>,
    config: RelayConfig,
    metrics: Arc<BridgeMetrics>,
    // Transfers with a submission being sent by this process.
    in_flight: Mutex<HashSet<TransferId>>,
}

// Releases the in-flight claim on drop.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<TransferId>>,
    transfer_id: TransferId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.transfer_id);
    }
}

impl<S, D> RelayEngine<S, D>
where
    S: ChainClientInner,
    D: ChainClientInner,
{
    pub fn new(
        direction: Direction,
        source: Arc<ChainClient<S>>,
        dest: Arc<ChainClient<D>>,
        store: Arc<BridgeLedgerTables>,
        signer: Arc<dyn BridgeSigner>,
        config: RelayConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        debug_assert_eq!(source.network(), direction.source());
        debug_assert_eq!(dest.network(), direction.dest());
        Self {
            direction,
            source,
            dest,
            store,
            signer,
            config,
            metrics,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn source(&self) -> &Arc<ChainClient<S>> {
        &self.source
    }

    pub fn dest(&self) -> &Arc<ChainClient<D>> {
        &self.dest
    }

    /// Scans new deposits up to the latest safe block, then submits due
    /// authorizations and confirms outstanding withdrawals.
    ///
    /// An `RpcError` aborts the cycle. The cursor only moves past an event
    /// once its transfer is durably recorded beyond `Observed`, so an aborted
    /// or crashed cycle rescans it next time.
    pub async fn run_cycle(&self, shutdown: CancellationToken) -> BridgeResult<CycleSummary> {
        let started = Instant::now();
        let direction = self.direction.as_str();
        let result = self.run_cycle_inner(&shutdown).await;
        self.metrics
            .relay_cycle_latency
            .with_label_values(&[direction])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(summary) => {
                self.metrics
                    .relay_cycles
                    .with_label_values(&[direction, "ok"])
                    .inc();
                if summary.observed + summary.completed + summary.failed + summary.requeued > 0 {
                    info!(direction, ?summary, "Relay cycle finished");
                } else {
                    debug!(direction, ?summary, "Relay cycle finished");
                }
            }
            Err(e) => {
                self.metrics
                    .relay_cycles
                    .with_label_values(&[direction, e.kind()])
                    .inc();
                warn!(direction, "Relay cycle aborted: {e}");
            }
        }
        result
    }

    async fn run_cycle_inner(&self, shutdown: &CancellationToken) -> BridgeResult<CycleSummary> {
        let mut summary = CycleSummary::default();
        self.scan_deposits(shutdown, &mut summary).await?;
        if !summary.interrupted {
            self.submit_authorized(shutdown, &mut summary).await?;
        }
        if !summary.interrupted {
            self.confirm_submitted(shutdown, &mut summary).await?;
        }
        self.refresh_state_gauges()?;
        Ok(summary)
    }

    async fn scan_deposits(
        &self,
        shutdown: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> BridgeResult<()> {
        let latest_safe_block = self.source.latest_safe_block().await?;
        summary.latest_safe_block = latest_safe_block;
        let mut cursor = self.store.get_cursor(self.direction)?;
        summary.cursor = cursor;
        let Some(latest_safe_block) = latest_safe_block else {
            debug!(
                direction = self.direction.as_str(),
                "No block is final on {} yet",
                self.direction.source()
            );
            return Ok(());
        };

        let mut from_block = match cursor {
            Some(position) if position.is_end_of_block() => position.block + 1,
            Some(position) => position.block,
            None => self.config.start_block,
        };
        let range = self.config.max_block_range.max(1);
        while from_block <= latest_safe_block {
            if shutdown.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let to_block = latest_safe_block.min(from_block.saturating_add(range - 1));
            let events = self.source.get_deposit_events(from_block, to_block).await?;
            debug!(
                direction = self.direction.as_str(),
                "Fetched {} deposits in blocks [{from_block}, {to_block}]",
                events.len()
            );
            for event in events {
                if cursor.map_or(false, |c| event.position() <= c) {
                    continue;
                }
                if shutdown.is_cancelled() {
                    summary.interrupted = true;
                    break;
                }
                self.process_deposit(&event, summary).await?;
                self.advance_cursor(event.position(), latest_safe_block)?;
                cursor = Some(event.position());
                summary.cursor = cursor;
            }
            if summary.interrupted {
                break;
            }
            let end = EventPosition::end_of_block(to_block);
            self.advance_cursor(end, latest_safe_block)?;
            cursor = Some(end);
            summary.cursor = cursor;
            from_block = to_block + 1;
        }
        Ok(())
    }

    fn advance_cursor(&self, position: EventPosition, latest_safe_block: u64) -> BridgeResult<()> {
        if position.block > latest_safe_block {
            return Err(BridgeError::InternalError(format!(
                "Cursor {position} beyond latest safe block {latest_safe_block}"
            )));
        }
        let direction = self.direction.as_str();
        match self.store.update_cursor(self.direction, position) {
            Ok(()) => {}
            // Another cycle of this direction is already further along.
            Err(e @ BridgeError::CursorRegression { .. }) => {
                debug!(direction, "Keeping stored cursor: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.metrics
            .cursor_block
            .with_label_values(&[direction])
            .set(position.block as i64);
        self.metrics
            .processing_lag
            .with_label_values(&[direction])
            .set(latest_safe_block.saturating_sub(position.block) as i64);
        Ok(())
    }

    // Returns Ok once the deposit needs no more attention from the scan.
    async fn process_deposit(
        &self,
        event: &DepositEvent,
        summary: &mut CycleSummary,
    ) -> BridgeResult<()> {
        let direction = self.direction.as_str();
        let transfer = Transfer::new_observed(event, self.direction.source(), now_ms());
        if self.store.insert_if_absent(&transfer)? {
            summary.observed += 1;
            self.metrics
                .observed_deposits
                .with_label_values(&[direction])
                .inc();
            info!(
                direction,
                transfer_id = ?event.transfer_id,
                block = event.block_number,
                "Observed deposit of {} for {:?}",
                event.amount,
                event.account
            );
        } else {
            let existing = self
                .store
                .get_transfer(&event.transfer_id)?
                .ok_or(BridgeError::TransferNotFound(event.transfer_id))?;
            if existing.deposit_tx_hash != event.tx_hash
                || existing.deposit_log_index != event.log_index
            {
                // Same id reused by a different deposit. The first one wins.
                self.alert(
                    "duplicate_transfer_id",
                    &event.transfer_id,
                    &format!(
                        "deposit in tx {:?} reuses the id of deposit in tx {:?}",
                        event.tx_hash, existing.deposit_tx_hash
                    ),
                );
                summary.skipped += 1;
                return Ok(());
            }
            if existing.state != TransferState::Observed {
                summary.skipped += 1;
                return Ok(());
            }
            debug!(direction, transfer_id = ?event.transfer_id, "Resuming observed transfer");
        }

        if let Err(e) = self.validate(&transfer).await {
            return match e {
                BridgeError::ValidationError(reason) => self.fail_transfer(
                    &transfer.transfer_id,
                    TransferState::Observed,
                    "validation",
                    reason,
                    summary,
                ),
                e => Err(e),
            };
        }

        let auth = match sign_authorization(
            self.signer.as_ref(),
            transfer.token_id,
            transfer.transfer_id,
            transfer.account,
            transfer.amount,
        ) {
            Ok(auth) => auth,
            Err(e) => {
                return self.fail_transfer(
                    &transfer.transfer_id,
                    TransferState::Observed,
                    "signing",
                    e.to_string(),
                    summary,
                )
            }
        };
        let authorized = self.store.transition(
            &transfer.transfer_id,
            TransferState::Observed,
            TransferState::Authorized,
            |t| {
                t.signature = Some(auth.signature.clone());
                t.last_error = None;
            },
        );
        let Some(authorized) = self.tolerate_stale(authorized, summary)? else {
            return Ok(());
        };
        summary.authorized += 1;
        self.metrics
            .authorized_transfers
            .with_label_values(&[direction])
            .inc();
        self.submit(authorized, summary).await
    }

    // Deposit checks. Only `ValidationError` marks the transfer as invalid.
    async fn validate(&self, transfer: &Transfer) -> BridgeResult<()> {
        if transfer.amount.is_zero() {
            return Err(BridgeError::ValidationError("Deposit amount is zero".into()));
        }
        if transfer.account.is_zero() {
            return Err(BridgeError::ValidationError(
                "Beneficiary is the zero address".into(),
            ));
        }
        if !self.dest.is_token_registered(transfer.token_id).await? {
            return Err(BridgeError::ValidationError(format!(
                "Token {:?} is not registered on {}",
                transfer.token_id,
                self.direction.dest()
            )));
        }
        Ok(())
    }

    fn claim(&self, transfer_id: TransferId) -> Option<InFlightGuard<'_>> {
        if !self.in_flight.lock().insert(transfer_id) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            transfer_id,
        })
    }

    // Sends the withdrawal of an `Authorized` transfer.
    async fn submit(&self, transfer: Transfer, summary: &mut CycleSummary) -> BridgeResult<()> {
        let direction = self.direction.as_str();
        let transfer_id = transfer.transfer_id;
        let Some(_claim) = self.claim(transfer_id) else {
            debug!(direction, ?transfer_id, "Submission already in flight");
            summary.stale += 1;
            return Ok(());
        };
        // The caller's copy may predate a submission by another cycle that
        // released its claim in the meantime.
        let transfer = match self.store.get_transfer(&transfer_id)? {
            Some(current)
                if current.state == TransferState::Authorized && current.is_due(now_ms()) =>
            {
                current
            }
            current => {
                debug!(
                    direction,
                    ?transfer_id,
                    state = ?current.map(|t| t.state),
                    "Transfer no longer due for submission"
                );
                summary.stale += 1;
                self.metrics
                    .stale_state_skips
                    .with_label_values(&[direction])
                    .inc();
                return Ok(());
            }
        };
        let Some(auth) = transfer.authorization() else {
            return self.fail_transfer(
                &transfer_id,
                TransferState::Authorized,
                "signing",
                "Authorized transfer carries no signature".into(),
                summary,
            );
        };

        match self.dest.submit_withdrawal(&auth).await {
            Ok(tx_hash) => {
                let submitted = self.store.transition(
                    &transfer_id,
                    TransferState::Authorized,
                    TransferState::Submitted,
                    |t| {
                        t.withdraw_tx_hash = Some(tx_hash);
                        t.next_retry_at = None;
                    },
                );
                if self.tolerate_stale(submitted, summary)?.is_some() {
                    summary.submitted += 1;
                    self.metrics
                        .submitted_withdrawals
                        .with_label_values(&[direction])
                        .inc();
                    info!(direction, ?transfer_id, ?tx_hash, "Submitted withdrawal");
                }
                Ok(())
            }
            Err(BridgeError::WithdrawalAlreadyExecuted) => {
                // Executed by an earlier submission; confirmation settles it.
                let submitted = self.store.transition(
                    &transfer_id,
                    TransferState::Authorized,
                    TransferState::Submitted,
                    |t| {
                        t.next_retry_at = None;
                        t.last_error = Some(BridgeError::WithdrawalAlreadyExecuted.to_string());
                    },
                );
                if self.tolerate_stale(submitted, summary)?.is_some() {
                    summary.submitted += 1;
                    info!(direction, ?transfer_id, "Withdrawal was already executed");
                }
                Ok(())
            }
            Err(e @ BridgeError::RpcError(_)) => Err(e),
            Err(e @ BridgeError::SubmissionError(_)) => self.record_failed_submission(
                &transfer,
                TransferState::Authorized,
                e.to_string(),
                summary,
            ),
            Err(e) => self.fail_transfer(
                &transfer_id,
                TransferState::Authorized,
                e.kind(),
                e.to_string(),
                summary,
            ),
        }
    }

    async fn submit_authorized(
        &self,
        shutdown: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> BridgeResult<()> {
        let now = now_ms();
        for transfer in self
            .store
            .get_transfers_by_state(TransferState::Authorized, Some(self.direction))?
        {
            if shutdown.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            if !transfer.is_due(now) {
                continue;
            }
            self.submit(transfer, summary).await?;
        }
        Ok(())
    }

    async fn confirm_submitted(
        &self,
        shutdown: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> BridgeResult<()> {
        let direction = self.direction.as_str();
        for transfer in self
            .store
            .get_transfers_by_state(TransferState::Submitted, Some(self.direction))?
        {
            if shutdown.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let transfer_id = transfer.transfer_id;
            match self.dest.get_withdrawal_status(transfer_id).await? {
                WithdrawalStatus::Executed => {
                    let completed = self.store.transition(
                        &transfer_id,
                        TransferState::Submitted,
                        TransferState::Completed,
                        |t| t.last_error = None,
                    );
                    if self.tolerate_stale(completed, summary)?.is_some() {
                        summary.completed += 1;
                        self.metrics
                            .completed_transfers
                            .with_label_values(&[direction])
                            .inc();
                        info!(direction, ?transfer_id, "Transfer completed");
                    }
                }
                WithdrawalStatus::Pending => {
                    let Some(tx_hash) = transfer.withdraw_tx_hash else {
                        // Reported as executed at submission but not executed now.
                        self.record_failed_submission(
                            &transfer,
                            TransferState::Submitted,
                            "Withdrawal reported executed but is pending".into(),
                            summary,
                        )?;
                        continue;
                    };
                    match self.dest.get_submission_status(tx_hash).await? {
                        SubmissionStatus::Pending => {
                            debug!(direction, ?transfer_id, ?tx_hash, "Withdrawal still pending");
                        }
                        SubmissionStatus::Succeeded => {
                            // Mined but the contract state lags behind; look again next cycle.
                            debug!(direction, ?transfer_id, ?tx_hash, "Withdrawal mined, awaiting state");
                        }
                        status @ (SubmissionStatus::Reverted | SubmissionStatus::Dropped) => {
                            self.record_failed_submission(
                                &transfer,
                                TransferState::Submitted,
                                format!("Withdrawal tx {tx_hash:?} {status:?}"),
                                summary,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // initial * 2^retry_count, capped.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.config
            .retry_backoff_initial
            .saturating_mul(factor)
            .min(self.config.retry_backoff_max)
    }

    // Puts a transfer whose submission failed back to `Authorized` with a
    // backoff, or fails it once the retry budget is spent.
    fn record_failed_submission(
        &self,
        transfer: &Transfer,
        from: TransferState,
        reason: String,
        summary: &mut CycleSummary,
    ) -> BridgeResult<()> {
        let transfer_id = transfer.transfer_id;
        let attempts = transfer.retry_count + 1;
        if attempts > self.config.max_submission_retries {
            return self.fail_transfer(
                &transfer_id,
                from,
                "retries_exhausted",
                format!("Gave up after {attempts} failed submissions: {reason}"),
                summary,
            );
        }
        let delay = self.backoff_delay(transfer.retry_count);
        let next_retry_at = now_ms().saturating_add(delay.as_millis() as u64);
        let update = |t: &mut Transfer| {
            t.retry_count = attempts;
            t.next_retry_at = Some(next_retry_at);
            t.last_error = Some(reason.clone());
        };
        let requeued = if from == TransferState::Authorized {
            self.store
                .update_in_state(&transfer_id, TransferState::Authorized, update)
        } else {
            self.store
                .transition(&transfer_id, from, TransferState::Authorized, update)
        };
        if self.tolerate_stale(requeued, summary)?.is_some() {
            summary.requeued += 1;
            self.metrics
                .resubmissions
                .with_label_values(&[self.direction.as_str()])
                .inc();
            warn!(
                direction = self.direction.as_str(),
                ?transfer_id,
                retry_count = attempts,
                "Withdrawal submission failed, retrying in {delay:?}: {reason}"
            );
        }
        Ok(())
    }

    fn fail_transfer(
        &self,
        transfer_id: &TransferId,
        from: TransferState,
        kind: &str,
        reason: String,
        summary: &mut CycleSummary,
    ) -> BridgeResult<()> {
        let failed = self
            .store
            .transition(transfer_id, from, TransferState::Failed, |t| {
                t.last_error = Some(reason.clone());
                t.next_retry_at = None;
            });
        if self.tolerate_stale(failed, summary)?.is_some() {
            summary.failed += 1;
            self.metrics
                .failed_transfers
                .with_label_values(&[self.direction.as_str(), kind])
                .inc();
            self.alert(kind, transfer_id, &reason);
        }
        Ok(())
    }

    // A lost optimistic transition is skipped for this cycle.
    fn tolerate_stale<T>(
        &self,
        result: BridgeResult<T>,
        summary: &mut CycleSummary,
    ) -> BridgeResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e @ BridgeError::StaleState { .. }) => {
                summary.stale += 1;
                self.metrics
                    .stale_state_skips
                    .with_label_values(&[self.direction.as_str()])
                    .inc();
                debug!(direction = self.direction.as_str(), "Skipping: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn alert(&self, kind: &str, transfer_id: &TransferId, reason: &str) {
        self.metrics.alerts.with_label_values(&[kind]).inc();
        error!(
            alert = true,
            direction = self.direction.as_str(),
            ?transfer_id,
            kind,
            "Transfer needs manual review: {reason}"
        );
    }

    fn refresh_state_gauges(&self) -> BridgeResult<()> {
        let direction = self.direction.as_str();
        for (state, count) in self.store.count_by_state(self.direction)? {
            self.metrics
                .transfers_by_state
                .with_label_values(&[direction, state.as_str()])
                .set(count as i64);
        }
        Ok(())
    }

    /// Operator retry of a `Failed` transfer: revalidates, signs again and
    /// puts it back to `Authorized` with a fresh retry budget.
    pub async fn retry_failed_transfer(&self, transfer_id: TransferId) -> BridgeResult<Transfer> {
        let transfer = self
            .store
            .get_transfer(&transfer_id)?
            .ok_or(BridgeError::TransferNotFound(transfer_id))?;
        if transfer.direction() != self.direction {
            return Err(BridgeError::InternalError(format!(
                "Transfer {transfer_id:?} belongs to {}, not {}",
                transfer.direction(),
                self.direction
            )));
        }
        if transfer.state != TransferState::Failed {
            return Err(BridgeError::StaleState {
                transfer_id,
                expected: TransferState::Failed,
                actual: transfer.state,
            });
        }
        self.validate(&transfer).await?;
        let auth = sign_authorization(
            self.signer.as_ref(),
            transfer.token_id,
            transfer.transfer_id,
            transfer.account,
            transfer.amount,
        )?;
        let retried = self.store.transition(
            &transfer_id,
            TransferState::Failed,
            TransferState::Authorized,
            |t| {
                t.signature = Some(auth.signature.clone());
                t.retry_count = 0;
                t.next_retry_at = None;
                t.last_error = None;
            },
        )?;
        info!(
            direction = self.direction.as_str(),
            ?transfer_id,
            "Failed transfer queued for retry"
        );
        Ok(retried)
    }
}

// Runs one relay cycle per scheduler tick and reports it to the status registry.
pub struct RelayJob<S, D> {
    name: String,
    engine: Arc<RelayEngine<S, D>>,
    status: Arc<StatusRegistry>,
}

impl<S, D> RelayJob<S, D>
where
    S: ChainClientInner,
    D: ChainClientInner,
{
    pub fn new(engine: Arc<RelayEngine<S, D>>, status: Arc<StatusRegistry>) -> Self {
        Self {
            name: format!("relay_{}", engine.direction()),
            engine,
            status,
        }
    }
}

#[async_trait]
impl<S, D> Job for RelayJob<S, D>
where
    S: ChainClientInner + 'static,
    D: ChainClientInner + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, shutdown: CancellationToken) -> BridgeResult<()> {
        let result = self.engine.run_cycle(shutdown).await;
        self.status.record_cycle(self.engine.direction(), &result);
        result.map(|_| ())
    }
}
