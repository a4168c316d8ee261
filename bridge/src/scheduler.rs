// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Runs named jobs on independent cadences. A job never overlaps with
//! itself: a tick that finds the previous invocation still running is
//! dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron::Schedule;
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    // `shutdown` is cancelled when the scheduler stops. Jobs should return at
    // their next safe stopping point.
    async fn run(&self, shutdown: CancellationToken) -> BridgeResult<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub name: String,
    pub schedule: String,
    pub invocations: u64,
    pub dropped_ticks: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub running: bool,
    // No more ticks are dispatched for this job.
    pub stopped: bool,
}

// Shared view of every job's state, read by the status endpoints.
#[derive(Clone, Debug, Default)]
pub struct JobStates(Arc<RwLock<BTreeMap<String, JobState>>>);

impl JobStates {
    pub fn snapshot(&self) -> Vec<JobState> {
        self.0.read().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<JobState> {
        self.0.read().get(name).cloned()
    }

    pub fn any_stopped(&self) -> bool {
        self.0.read().values().any(|state| state.stopped)
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut JobState)) {
        if let Some(state) = self.0.write().get_mut(name) {
            f(state);
        }
    }
}

pub struct Scheduler {
    pending: Vec<(Arc<dyn Job>, Schedule)>,
    states: JobStates,
    shutdown: CancellationToken,
    tickers: Vec<JoinHandle<()>>,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
    metrics: Arc<BridgeMetrics>,
}

impl Scheduler {
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            pending: vec![],
            states: JobStates::default(),
            shutdown: CancellationToken::new(),
            tickers: vec![],
            in_flight: Default::default(),
            metrics,
        }
    }

    pub fn add_job(&mut self, job: Arc<dyn Job>, schedule: Schedule) -> BridgeResult<()> {
        let name = job.name().to_string();
        let mut states = self.states.0.write();
        if states.contains_key(&name) {
            return Err(BridgeError::ConfigError(format!(
                "Job {name} is already scheduled"
            )));
        }
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::InternalError(
                "Scheduler is stopped".to_string(),
            ));
        }
        states.insert(
            name.clone(),
            JobState {
                name,
                schedule: schedule.to_string(),
                ..Default::default()
            },
        );
        self.pending.push((job, schedule));
        Ok(())
    }

    // Starts ticking every job added so far.
    pub fn start(&mut self) {
        for (job, schedule) in self.pending.drain(..) {
            info!(job = job.name(), %schedule, "Scheduling job");
            let ticker = Ticker {
                job,
                schedule,
                states: self.states.clone(),
                shutdown: self.shutdown.clone(),
                stop: self.shutdown.child_token(),
                in_flight: self.in_flight.clone(),
                metrics: self.metrics.clone(),
            };
            self.tickers.push(tokio::spawn(ticker.run()));
        }
    }

    pub fn job_states(&self) -> JobStates {
        self.states.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops dispatching ticks and waits up to `timeout` for running
    /// invocations. Returns false if some were abandoned.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let tickers = std::mem::take(&mut self.tickers);
        let aborts: Vec<AbortHandle> = tickers.iter().map(|t| t.abort_handle()).collect();
        match tokio::time::timeout(timeout, join_all(tickers)).await {
            Ok(_) => {
                info!("Scheduler stopped");
                true
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                let abandoned: Vec<(String, AbortHandle)> =
                    self.in_flight.lock().drain().collect();
                for (name, handle) in abandoned {
                    warn!(job = name, "Abandoning job invocation after shutdown timeout");
                    handle.abort();
                }
                false
            }
        }
    }
}

struct Ticker {
    job: Arc<dyn Job>,
    schedule: Schedule,
    states: JobStates,
    // Passed to invocations.
    shutdown: CancellationToken,
    // Ends this ticker only.
    stop: CancellationToken,
    in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
    metrics: Arc<BridgeMetrics>,
}

async fn wait_invocation(
    current: &mut Option<JoinHandle<BridgeResult<()>>>,
) -> Result<BridgeResult<()>, JoinError> {
    match current {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl Ticker {
    async fn run(self) {
        let name = self.job.name().to_string();
        let mut current: Option<JoinHandle<BridgeResult<()>>> = None;
        let mut next_tick = self.schedule.next_after(Utc::now());
        loop {
            let Some(tick_at) = next_tick else {
                warn!(job = name, "Schedule {} never fires again", self.schedule);
                break;
            };
            let wait = (tick_at - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                result = wait_invocation(&mut current) => {
                    current = None;
                    self.finish(&name, result);
                }
                _ = tokio::time::sleep(wait) => {
                    // Ticks missed while sleeping are skipped.
                    next_tick = self.schedule.next_after(tick_at.max(Utc::now()));
                    if current.is_some() {
                        self.states.update(&name, |s| s.dropped_ticks += 1);
                        self.metrics
                            .scheduler_dropped_ticks
                            .with_label_values(&[&name])
                            .inc();
                        warn!(job = name, "Previous invocation still running, dropping tick");
                        continue;
                    }
                    current = Some(self.dispatch(&name));
                }
            }
        }
        self.states.update(&name, |s| s.stopped = true);
        // Let the running invocation reach its stopping point.
        if let Some(handle) = current {
            let result = handle.await;
            self.finish(&name, result);
        }
        debug!(job = name, "Ticker exited");
    }

    fn dispatch(&self, name: &str) -> JoinHandle<BridgeResult<()>> {
        let job = self.job.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move { job.run(shutdown).await });
        self.in_flight
            .lock()
            .insert(name.to_string(), handle.abort_handle());
        self.states.update(name, |s| {
            s.invocations += 1;
            s.running = true;
            s.last_started_at = Some(Utc::now());
        });
        self.metrics
            .scheduler_invocations
            .with_label_values(&[name])
            .inc();
        handle
    }

    fn finish(&self, name: &str, result: Result<BridgeResult<()>, JoinError>) {
        self.in_flight.lock().remove(name);
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                if e.is_fatal() {
                    error!(alert = true, job = name, "Job hit a fatal error, stopping it: {e}");
                    self.stop.cancel();
                } else {
                    warn!(job = name, "Job invocation failed: {e}");
                }
                Some((e.kind(), e.to_string()))
            }
            Err(e) if e.is_panic() => {
                error!(job = name, "Job invocation panicked: {e}");
                Some(("panic", format!("panicked: {e}")))
            }
            Err(e) => {
                warn!(job = name, "Job invocation was cancelled: {e}");
                Some(("cancelled", e.to_string()))
            }
        };
        if let Some((kind, _)) = &error {
            self.metrics
                .scheduler_job_errors
                .with_label_values(&[name, kind])
                .inc();
        }
        self.states.update(name, |s| {
            s.running = false;
            s.last_finished_at = Some(Utc::now());
            if let Some((_, message)) = error {
                s.failures += 1;
                s.last_error = Some(message);
            }
        });
    }
}
