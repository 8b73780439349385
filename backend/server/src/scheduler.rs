//! # Backup sweep
//!
//! Every interval (hourly by default) and on demand, each known bin's live reading is
//! validated and, if usable, written to the backup store.
//!
//! ## Rules
//! - Every enumerated bin is processed; one bin failing never stops the others
//! - Per-bin work runs concurrently, capped by a semaphore so the store is not flooded
//! - At most one sweep is in flight; a trigger during a running sweep is rejected
//! - A sweep past its timeout is abandoned; its per-bin tasks are stopped before another
//!   sweep can start, and writes already committed stay committed
//!
//! Retrying is always safe. A repeated sweep re-validates and the store drops anything
//! not strictly newer than what it holds.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    clock::Clock,
    coordinate::LivePolicy,
    metrics::SweepMetrics,
    store::{
        BackupRecord, BackupStore, FleetListing, LiveSource, SOURCE_SCHEDULED, StoreError,
        UpsertOutcome,
    },
};

#[derive(Error, Debug, Clone)]
pub enum SweepError {
    #[error("A backup sweep is already running")]
    AlreadyRunning,

    #[error("Backup sweep exceeded {0:?}")]
    TimedOut(Duration),

    #[error("Could not list fleet: {0}")]
    Fleet(StoreError),

    #[error("Backup sweep task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum BinOutcome {
    BackedUp,
    SkippedInvalidLive,
    SkippedStaleWrite,
    Failed { reason: String },
}

impl BinOutcome {
    fn failed(reason: impl ToString) -> Self {
        BinOutcome::Failed {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinSweepResult {
    pub bin_id: String,
    #[serde(flatten)]
    pub outcome: BinOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub sweep_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub backed_up: usize,
    pub skipped_invalid_live: usize,
    pub skipped_stale_write: usize,
    pub failed: usize,
    /// At least one bin failed.
    pub partial_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    #[serde(flatten)]
    pub summary: SweepSummary,
    pub bins: Vec<BinSweepResult>,
}

impl SweepReport {
    fn new(
        sweep_id: u64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        bins: Vec<BinSweepResult>,
    ) -> Self {
        let count = |wanted: fn(&BinOutcome) -> bool| {
            bins.iter().filter(|b| wanted(&b.outcome)).count()
        };

        let failed = count(|o| matches!(o, BinOutcome::Failed { .. }));

        Self {
            summary: SweepSummary {
                sweep_id,
                started_at,
                finished_at,
                total: bins.len(),
                backed_up: count(|o| matches!(o, BinOutcome::BackedUp)),
                skipped_invalid_live: count(|o| matches!(o, BinOutcome::SkippedInvalidLive)),
                skipped_stale_write: count(|o| matches!(o, BinOutcome::SkippedStaleWrite)),
                failed,
                partial_failure: failed > 0,
            },
            bins,
        }
    }

    pub fn outcome(&self, bin_id: &str) -> Option<&BinOutcome> {
        self.bins
            .iter()
            .find(|b| b.bin_id == bin_id)
            .map(|b| &b.outcome)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub interval: Duration,
    pub concurrency: usize,
    pub timeout: Option<Duration>,
    pub policy: LivePolicy,
}

#[derive(Debug, Clone, Default)]
struct History {
    last_run: Option<SweepSummary>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub concurrency: usize,
    pub timeout_secs: Option<u64>,
    pub sweeps_total: u64,
    pub sweeps_rejected_total: u64,
    pub sweeps_timed_out_total: u64,
    pub backups_committed_total: u64,
    pub last_run: Option<SweepSummary>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Everything a single bin's backup needs, cloned into each per-bin task.
#[derive(Clone)]
struct BinJob {
    store: Arc<dyn BackupStore>,
    live: Arc<dyn LiveSource>,
    clock: Arc<dyn Clock>,
    policy: LivePolicy,
}

impl BinJob {
    async fn back_up(&self, bin_id: &str) -> BinOutcome {
        let reading = match self.live.live_reading(bin_id).await {
            Ok(reading) => reading,
            Err(e) => return BinOutcome::failed(e),
        };

        let Some(coordinate) = reading.and_then(|r| self.policy.usable(&r, self.clock.now()))
        else {
            debug!(bin_id, "No usable live reading, keeping existing backup");
            return BinOutcome::SkippedInvalidLive;
        };

        let record = BackupRecord::new(coordinate, SOURCE_SCHEDULED);

        match self.store.upsert(bin_id, record).await {
            Ok(UpsertOutcome::Committed) => BinOutcome::BackedUp,
            Ok(UpsertOutcome::Stale) => BinOutcome::SkippedStaleWrite,
            Err(e) => BinOutcome::failed(e),
        }
    }
}

pub struct BackupScheduler {
    job: BinJob,
    fleet: Arc<dyn FleetListing>,
    config: SweepConfig,
    gate: Mutex<()>,
    history: RwLock<History>,
    metrics: SweepMetrics,
    next_sweep_id: AtomicU64,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<dyn BackupStore>,
        live: Arc<dyn LiveSource>,
        fleet: Arc<dyn FleetListing>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            job: BinJob {
                store,
                live,
                clock,
                policy: config.policy,
            },
            fleet,
            config,
            gate: Mutex::new(()),
            history: RwLock::new(History::default()),
            metrics: SweepMetrics::default(),
            next_sweep_id: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Runs one sweep, or refuses if another is in flight.
    pub async fn run_sweep(&self) -> Result<SweepReport, SweepError> {
        let Ok(_guard) = self.gate.try_lock() else {
            self.metrics.sweeps_rejected_total.inc();
            warn!("Backup sweep already running, rejecting trigger");
            return Err(SweepError::AlreadyRunning);
        };

        let sweep_id = self.next_sweep_id.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("backup_sweep", sweep_id);
        let mut tasks = JoinSet::new();

        let result = match self.config.timeout {
            Some(limit) => {
                let bounded = timeout(limit, self.sweep(sweep_id, &mut tasks))
                    .instrument(span)
                    .await;

                match bounded {
                    Ok(result) => result,
                    Err(_) => {
                        // Per-bin tasks must be gone before the gate opens again.
                        tasks.shutdown().await;
                        self.metrics.sweeps_timed_out_total.inc();
                        Err(SweepError::TimedOut(limit))
                    }
                }
            }
            None => self.sweep(sweep_id, &mut tasks).instrument(span).await,
        };

        self.record(&result).await;

        result
    }

    /// Runs one sweep on its own task, so dropping the caller never cuts a sweep short.
    pub async fn trigger(self: &Arc<Self>) -> Result<SweepReport, SweepError> {
        let scheduler = self.clone();

        tokio::spawn(async move { scheduler.run_sweep().await })
            .await
            .map_err(|e| SweepError::TaskFailed(e.to_string()))?
    }

    async fn sweep(
        &self,
        sweep_id: u64,
        tasks: &mut JoinSet<(usize, BinOutcome)>,
    ) -> Result<SweepReport, SweepError> {
        let started_at = self.job.clock.now();
        let bin_ids = self
            .fleet
            .list_bin_ids()
            .await
            .map_err(SweepError::Fleet)?;

        info!(bins = bin_ids.len(), "Starting backup sweep");

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));

        for (index, bin_id) in bin_ids.iter().enumerate() {
            let job = self.job.clone();
            let permits = permits.clone();
            let bin_id = bin_id.clone();

            tasks.spawn(
                async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) => job.back_up(&bin_id).await,
                        Err(_) => BinOutcome::failed("sweep cancelled"),
                    };

                    (index, outcome)
                }
                .in_current_span(),
            );
        }

        let mut outcomes: Vec<Option<BinOutcome>> = vec![None; bin_ids.len()];

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!(error = %e, "Backup task panicked"),
            }
        }

        let bins: Vec<BinSweepResult> = bin_ids
            .into_iter()
            .zip(outcomes)
            .map(|(bin_id, outcome)| {
                let outcome = outcome.unwrap_or_else(|| BinOutcome::failed("backup task lost"));

                match &outcome {
                    BinOutcome::Failed { reason } => {
                        warn!(bin_id = %bin_id, reason = %reason, "Bin backup failed")
                    }
                    other => debug!(bin_id = %bin_id, outcome = ?other, "Bin processed"),
                }

                BinSweepResult { bin_id, outcome }
            })
            .collect();

        let report = SweepReport::new(sweep_id, started_at, self.job.clock.now(), bins);

        info!(
            total = report.summary.total,
            backed_up = report.summary.backed_up,
            skipped_invalid_live = report.summary.skipped_invalid_live,
            skipped_stale_write = report.summary.skipped_stale_write,
            failed = report.summary.failed,
            "Backup sweep finished"
        );

        Ok(report)
    }

    async fn record(&self, result: &Result<SweepReport, SweepError>) {
        self.metrics.sweeps_total.inc();

        let mut history = self.history.write().await;

        match result {
            Ok(report) => {
                let summary = &report.summary;
                self.metrics
                    .backups_committed_total
                    .inc_by(summary.backed_up as u64);
                self.metrics
                    .skipped_invalid_total
                    .inc_by(summary.skipped_invalid_live as u64);
                self.metrics
                    .skipped_stale_total
                    .inc_by(summary.skipped_stale_write as u64);
                self.metrics
                    .bin_failures_total
                    .inc_by(summary.failed as u64);

                history.last_run = Some(summary.clone());
            }
            Err(e) => {
                error!(error = %e, "Backup sweep aborted");

                history.last_error = Some(e.to_string());
                history.last_error_at = Some(self.job.clock.now());
            }
        }

        self.metrics.emit();
    }

    pub async fn status(&self) -> SchedulerStatus {
        let history = self.history.read().await.clone();

        SchedulerStatus {
            running: self.is_running(),
            interval_secs: self.config.interval.as_secs(),
            concurrency: self.config.concurrency,
            timeout_secs: self.config.timeout.map(|t| t.as_secs()),
            sweeps_total: self.metrics.sweeps_total.get(),
            sweeps_rejected_total: self.metrics.sweeps_rejected_total.get(),
            sweeps_timed_out_total: self.metrics.sweeps_timed_out_total.get(),
            backups_committed_total: self.metrics.backups_committed_total.get(),
            last_run: history.last_run,
            last_error: history.last_error,
            last_error_at: history.last_error_at,
        }
    }

    /// Sweeps once immediately, then on every interval tick. Missed ticks are skipped.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                match scheduler.run_sweep().await {
                    Ok(report) if report.summary.partial_failure => {
                        warn!(failed = report.summary.failed, "Scheduled sweep had failures")
                    }
                    Ok(_) => {}
                    Err(SweepError::AlreadyRunning) => {
                        info!("Skipping scheduled sweep, one is already running")
                    }
                    Err(_) => {}
                }
            }
        })
    }
}
