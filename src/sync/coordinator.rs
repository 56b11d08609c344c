//! Sync coordinator: single-flight runs, retries, cancellation, diagnostics

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::applier::{ApplyProgress, ApplyRequest, ProgressFn, TransactionalApplier};
use super::fetcher::ArtifactFetcher;
use super::manifest::ManifestClient;
use super::resolver::{resolve_strategy, LocalVersion, PlanReason, SyncPlan};
use super::source::{ArtifactSource, HttpArtifactSource};
use super::{RunStatus, SyncOutcome, SyncPhase, SyncProgress, SyncReport};
use crate::error::{Result, SyncError};
use crate::storage::catalog::{count_records, rebuild_set_summary};
use crate::storage::sync_state::{begin_run, finish_run, take_leftover_runs, update_run_phase};
use crate::storage::{HistoryRecord, RunMarker, Storage, SyncStateStore};
use crate::types::{normalize_dataset, ApplyHistoryEntry, ApplyOutcome, Strategy, SyncConfig};

/// Longest single backoff delay between attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// In-flight run of a dataset, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightRun {
    pub run_id: String,
    pub phase: SyncPhase,
    pub progress: SyncProgress,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    /// Non-terminal for longer than the configured stuck timeout
    pub stuck: bool,
}

/// Per-dataset counters and last-run facts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncDiagnostics {
    pub dataset: String,
    pub last_outcome: Option<SyncOutcome>,
    pub last_strategy: Option<Strategy>,
    pub last_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub runs_started: u64,
    pub retry_count: u64,
    pub cancel_count: u64,
    pub joined_callers: u64,
    pub recovered_runs: u64,
    pub stuck_timeout_secs: u64,
    pub in_flight: Option<InFlightRun>,
}

/// Snapshot of a dataset's sync state for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatus {
    pub dataset: String,
    pub client_id: String,
    pub current_version: Option<String>,
    pub state_hash: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub record_count: i64,
    pub db_path: String,
    pub db_size_bytes: i64,
    pub last_attempt: Option<ApplyHistoryEntry>,
    pub diagnostics: SyncDiagnostics,
}

/// Caller's view of a run
///
/// Several handles may observe the same run when callers join an in-flight
/// sync. Canceling through any of them cancels the shared run.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    dataset: String,
    run_id: String,
    joined: bool,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
}

impl SyncHandle {
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Whether this handle joined a run another caller started
    pub fn joined(&self) -> bool {
        self.joined
    }

    pub fn phase(&self) -> SyncPhase {
        self.status.borrow().phase
    }

    pub fn progress(&self) -> SyncProgress {
        self.status.borrow().progress
    }

    /// Request cancellation; honored at the next phase boundary
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Watch phase and progress changes
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Wait for the run to reach a terminal phase
    pub async fn wait(mut self) -> Result<SyncReport> {
        loop {
            let report = self.status.borrow_and_update().report.clone();
            if let Some(report) = report {
                return Ok(report);
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().report.clone().ok_or_else(|| {
                    SyncError::Internal(format!("Sync run {} ended without a report", self.run_id))
                });
            }
        }
    }
}

struct RegistryEntry {
    run_id: String,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    task: JoinHandle<()>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl RegistryEntry {
    fn is_active(&self) -> bool {
        self.status.borrow().report.is_none() && !self.is_dead()
    }

    /// Task gone without publishing a report (aborted, runtime shut down)
    fn is_dead(&self) -> bool {
        self.status.borrow().report.is_none()
            && (self.task.is_finished() || self.status.has_changed().is_err())
    }
}

/// Mutable facts about one run, owned by its task
struct Run {
    dataset: String,
    run_id: String,
    cancel: CancellationToken,
    status: Arc<watch::Sender<RunStatus>>,
    started: Instant,
    initial_version: Option<String>,
    current_version: Option<String>,
    strategy: Option<Strategy>,
    reason: Option<PlanReason>,
    target_version: Option<String>,
    steps_applied: usize,
    attempts: u32,
}

impl Run {
    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        Ok(())
    }
}

enum AttemptEnd {
    Applied,
    UpToDate,
}

enum RunEnd {
    Synced,
    UpToDate,
    Canceled,
    Failed(SyncError),
}

struct CoordinatorInner {
    storage: Storage,
    state: SyncStateStore,
    manifests: ManifestClient,
    fetcher: ArtifactFetcher,
    applier: TransactionalApplier,
    config: SyncConfig,
    registry: Mutex<HashMap<String, RegistryEntry>>,
    diagnostics: DashMap<String, SyncDiagnostics>,
}

/// Entry point for sync runs
///
/// At most one run per dataset is in flight; callers arriving while one is
/// running join it instead of starting another.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Create a coordinator and recover runs interrupted by a previous process
    pub fn new(
        storage: Storage,
        source: Arc<dyn ArtifactSource>,
        config: SyncConfig,
    ) -> Result<Self> {
        let inner = CoordinatorInner {
            state: SyncStateStore::new(storage.clone(), config.client_id.clone()),
            manifests: ManifestClient::new(source.clone()),
            fetcher: ArtifactFetcher::new(source),
            applier: TransactionalApplier::new(
                storage.clone(),
                config.client_id.clone(),
                config.apply_batch_size,
            ),
            storage,
            config,
            registry: Mutex::new(HashMap::new()),
            diagnostics: DashMap::new(),
        };
        let coordinator = Self {
            inner: Arc::new(inner),
        };
        coordinator.recover_interrupted_runs()?;
        Ok(coordinator)
    }

    /// Coordinator fetching artifacts over HTTP from `config.base_url`
    pub fn with_http(storage: Storage, config: SyncConfig) -> Result<Self> {
        let source = HttpArtifactSource::new(&config)?;
        Self::new(storage, Arc::new(source), config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn state_store(&self) -> &SyncStateStore {
        &self.inner.state
    }

    /// Start a run, or join the one already in flight for this dataset
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, dataset: &str) -> Result<SyncHandle> {
        let dataset = normalize_dataset(dataset).map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Internal(format!("No Tokio runtime: {}", e)))?;

        let mut registry = self.inner.registry.lock();
        let dead = registry
            .get(&dataset)
            .filter(|entry| entry.is_dead())
            .map(|entry| (entry.run_id.clone(), entry.status.borrow().phase));
        if let Some((run_id, phase)) = dead {
            registry.remove(&dataset);
            self.inner.record_interrupted(&dataset, &run_id, phase.as_str())?;
        }
        if let Some(entry) = registry.get(&dataset) {
            if entry.is_active() {
                self.inner.bump(&dataset, |d| d.joined_callers += 1);
                tracing::debug!(dataset = %dataset, run_id = %entry.run_id, "Joining in-flight sync");
                return Ok(SyncHandle {
                    dataset,
                    run_id: entry.run_id.clone(),
                    joined: true,
                    cancel: entry.cancel.clone(),
                    status: entry.status.clone(),
                });
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (sender, receiver) = watch::channel(RunStatus::new(run_id.clone()));

        self.inner.bump(&dataset, |d| d.runs_started += 1);
        tracing::info!(dataset = %dataset, run_id = %run_id, "Starting sync");

        let inner = self.inner.clone();
        let run = Run {
            dataset: dataset.clone(),
            run_id: run_id.clone(),
            cancel: cancel.clone(),
            status: Arc::new(sender),
            started: Instant::now(),
            initial_version: None,
            current_version: None,
            strategy: None,
            reason: None,
            target_version: None,
            steps_applied: 0,
            attempts: 0,
        };
        // The registry lock is held until the entry is in, so the task's
        // own cleanup in `finish` always finds it
        let task = runtime.spawn(async move { inner.execute(run).await });
        registry.insert(
            dataset.clone(),
            RegistryEntry {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
                status: receiver.clone(),
                task,
                started: Instant::now(),
                started_at: Utc::now(),
            },
        );
        drop(registry);

        Ok(SyncHandle {
            dataset,
            run_id,
            joined: false,
            cancel,
            status: receiver,
        })
    }

    /// Start (or join) a run and wait for its report
    pub async fn run(&self, dataset: &str) -> Result<SyncReport> {
        self.start(dataset)?.wait().await
    }

    /// Cancel the in-flight run of a dataset; returns false if none is running
    pub fn cancel(&self, dataset: &str) -> bool {
        let Ok(dataset) = normalize_dataset(dataset) else {
            return false;
        };
        let registry = self.inner.registry.lock();
        match registry.get(&dataset) {
            Some(entry) if entry.is_active() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Counters and in-flight state for a dataset
    pub fn diagnostics(&self, dataset: &str) -> SyncDiagnostics {
        let dataset = normalize_dataset(dataset).unwrap_or_else(|_| dataset.to_string());
        let mut diagnostics = self
            .inner
            .diagnostics
            .get(&dataset)
            .map(|d| d.value().clone())
            .unwrap_or_else(|| self.inner.empty_diagnostics(&dataset));

        let registry = self.inner.registry.lock();
        diagnostics.in_flight = registry.get(&dataset).and_then(|entry| {
            if !entry.is_active() {
                return None;
            }
            let status = entry.status.borrow();
            let elapsed = entry.started.elapsed();
            Some(InFlightRun {
                run_id: entry.run_id.clone(),
                phase: status.phase,
                progress: status.progress,
                started_at: entry.started_at,
                elapsed_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
                stuck: elapsed > Duration::from_secs(self.inner.config.stuck_timeout_secs),
            })
        });
        diagnostics
    }

    /// Fetch the manifest and resolve a plan without applying anything
    pub async fn plan(&self, dataset: &str) -> Result<SyncPlan> {
        let dataset = normalize_dataset(dataset).map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        let manifest = self
            .inner
            .manifests
            .fetch(&dataset, &CancellationToken::new())
            .await?;
        let local = self.inner.state.load(&dataset)?;
        let force_full = self.inner.state.needs_full_resync(&dataset)?;
        Ok(resolve_strategy(
            &LocalVersion::from(local.as_ref()),
            &manifest,
            force_full,
        ))
    }

    /// Local state, last ledger row, and diagnostics for a dataset
    pub fn status(&self, dataset: &str) -> Result<DatasetStatus> {
        let dataset = normalize_dataset(dataset).map_err(|e| SyncError::InvalidInput(e.to_string()))?;
        let state = self.inner.state.load(&dataset)?;
        let record_count = self
            .inner
            .storage
            .with_connection(|conn| count_records(conn, &dataset))?;
        let last_attempt = self.inner.state.last_attempt(&dataset)?;

        Ok(DatasetStatus {
            client_id: self.inner.config.client_id.clone(),
            current_version: state.as_ref().and_then(|s| s.current_version.clone()),
            state_hash: state.as_ref().and_then(|s| s.state_hash.clone()),
            synced_at: state.as_ref().and_then(|s| s.synced_at),
            record_count,
            db_path: self.inner.storage.config().db_path.clone(),
            db_size_bytes: self.inner.storage.db_size()?,
            last_attempt,
            diagnostics: self.diagnostics(&dataset),
            dataset,
        })
    }

    /// Mark runs left non-terminal by a previous process as failed
    fn recover_interrupted_runs(&self) -> Result<usize> {
        let markers = self.inner.storage.with_connection(take_leftover_runs)?;
        for marker in &markers {
            self.inner
                .record_interrupted(&marker.dataset, &marker.run_id, &marker.phase)?;
        }
        Ok(markers.len())
    }
}

impl CoordinatorInner {
    /// Ledger a run that ended without reaching a terminal phase
    fn record_interrupted(&self, dataset: &str, run_id: &str, phase: &str) -> Result<()> {
        self.storage
            .with_connection(|conn| finish_run(conn, dataset, run_id))?;
        let current = self.state.load(dataset)?.and_then(|s| s.current_version);
        self.state.append(&HistoryRecord {
            dataset: dataset.to_string(),
            from_version: current.clone(),
            to_version: current,
            result: Some(ApplyOutcome::Error),
            error_kind: Some("interrupted".to_string()),
            error_message: Some(format!("Run {} interrupted during {}", run_id, phase)),
            ..Default::default()
        })?;
        self.bump(dataset, |d| {
            d.recovered_runs += 1;
            d.last_outcome = Some(SyncOutcome::Failed);
            d.last_error = Some(format!("Interrupted during {}", phase));
        });
        tracing::warn!(
            dataset = %dataset,
            run_id = %run_id,
            phase = %phase,
            "Recovered interrupted sync run"
        );
        Ok(())
    }

    fn empty_diagnostics(&self, dataset: &str) -> SyncDiagnostics {
        SyncDiagnostics {
            dataset: dataset.to_string(),
            stuck_timeout_secs: self.config.stuck_timeout_secs,
            ..Default::default()
        }
    }

    fn bump(&self, dataset: &str, update: impl FnOnce(&mut SyncDiagnostics)) {
        let mut entry = self
            .diagnostics
            .entry(dataset.to_string())
            .or_insert_with(|| self.empty_diagnostics(dataset));
        update(&mut entry);
    }

    fn set_phase(&self, run: &Run, phase: SyncPhase) {
        run.status.send_modify(|s| s.phase = phase);
        if !phase.is_terminal() {
            if let Err(e) = self.storage.with_connection(|conn| {
                update_run_phase(conn, &run.dataset, &run.run_id, phase.as_str())
            }) {
                tracing::warn!(error = %e, "Failed to persist run phase");
            }
        }
        tracing::debug!(dataset = %run.dataset, run_id = %run.run_id, phase = %phase, "Sync phase");
    }

    async fn execute(self: Arc<Self>, mut run: Run) {
        let now = Utc::now();
        let marker = RunMarker {
            dataset: run.dataset.clone(),
            run_id: run.run_id.clone(),
            client_id: self.config.client_id.clone(),
            phase: SyncPhase::Idle.as_str().to_string(),
            started_at: now,
            updated_at: now,
        };
        if let Err(e) = self.storage.with_connection(|conn| begin_run(conn, &marker)) {
            tracing::warn!(error = %e, "Failed to persist run marker");
        }

        let end = self.drive(&mut run).await;
        self.finish(run, end).await;
    }

    async fn drive(&self, run: &mut Run) -> RunEnd {
        let mut force_full = false;
        loop {
            run.attempts += 1;
            let err = match self.attempt(run, force_full).await {
                Ok(AttemptEnd::Applied) => return RunEnd::Synced,
                Ok(AttemptEnd::UpToDate) => return RunEnd::UpToDate,
                Err(SyncError::Canceled) => {
                    self.record_canceled(run);
                    return RunEnd::Canceled;
                }
                Err(err) => err,
            };

            // A bad chain or a vanished patch is repaired with a snapshot
            let escalate = matches!(err, SyncError::HashMismatch { .. })
                || (matches!(err, SyncError::NotFound(_))
                    && matches!(run.strategy, Some(Strategy::Chain | Strategy::Compacted)));
            if !(err.is_retryable() || escalate) || run.attempts >= self.config.max_attempts {
                return RunEnd::Failed(err);
            }
            if escalate {
                force_full = true;
            }

            self.bump(&run.dataset, |d| d.retry_count += 1);
            let delay = self.backoff(run.attempts);
            tracing::warn!(
                dataset = %run.dataset,
                attempt = run.attempts,
                delay_ms = delay.as_millis() as u64,
                force_full,
                error = %err,
                "Sync attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => {
                    self.record_canceled(run);
                    return RunEnd::Canceled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, run: &mut Run, force_full: bool) -> Result<AttemptEnd> {
        let started = Instant::now();
        run.check_cancel()?;

        self.set_phase(run, SyncPhase::CheckingManifest);
        let manifest = self
            .manifests
            .fetch(&run.dataset, &run.cancel)
            .await
            .map_err(|e| self.fail(run, None, started, e))?;

        self.set_phase(run, SyncPhase::Resolving);
        let local = self
            .state
            .load(&run.dataset)
            .map_err(|e| self.fail(run, None, started, e))?;
        let forced = force_full
            || self
                .state
                .needs_full_resync(&run.dataset)
                .map_err(|e| self.fail(run, None, started, e))?;

        let local = LocalVersion::from(local.as_ref());
        if run.attempts == 1 {
            run.initial_version = local.version.clone();
        }
        run.current_version = local.version.clone();

        let plan = resolve_strategy(&local, &manifest, forced);
        run.strategy = Some(plan.strategy);
        run.reason = Some(plan.reason);
        run.target_version = Some(plan.target_version.clone());
        tracing::info!(
            dataset = %run.dataset,
            strategy = %plan.strategy,
            reason = plan.reason.as_str(),
            missed = ?plan.missed,
            current = ?plan.current_version,
            target = %plan.target_version,
            "Resolved sync strategy"
        );

        if plan.is_noop() {
            return Ok(AttemptEnd::UpToDate);
        }

        let total_steps = plan.steps.len();
        for (index, step) in plan.steps.iter().enumerate() {
            run.check_cancel()?;
            run.status.send_modify(|s| {
                s.progress = SyncProgress {
                    step: index + 1,
                    total_steps,
                    rows_written: 0,
                    rows_total: 0,
                }
            });

            self.set_phase(run, SyncPhase::Fetching);
            let artifact = self
                .fetcher
                .fetch(&run.dataset, step, &run.cancel)
                .await
                .map_err(|e| self.fail(run, Some(&step.to_version), started, e))?;

            run.check_cancel()?;
            self.set_phase(run, SyncPhase::Applying);

            let sender = run.status.clone();
            let progress: ProgressFn = Arc::new(move |p: ApplyProgress| {
                sender.send_modify(|s| {
                    s.progress.rows_written = p.rows_written;
                    s.progress.rows_total = p.rows_total;
                });
            });
            let request = ApplyRequest {
                dataset: run.dataset.clone(),
                source_id: manifest.source_id().to_string(),
                strategy: plan.strategy,
                step: step.clone(),
                artifact,
            };
            // The applier records its own failures in the ledger
            let summary = self.applier.apply_async(request, Some(progress)).await?;

            run.steps_applied += 1;
            run.current_version = Some(summary.to_version);
        }

        Ok(AttemptEnd::Applied)
    }

    /// Record a non-apply failure in the ledger and hand the error back
    fn fail(&self, run: &Run, to_version: Option<&str>, started: Instant, err: SyncError) -> SyncError {
        if matches!(err, SyncError::Canceled) {
            return err;
        }
        let record = HistoryRecord {
            dataset: run.dataset.clone(),
            from_version: run.current_version.clone(),
            to_version: to_version
                .map(String::from)
                .or_else(|| run.target_version.clone()),
            strategy: run.strategy,
            duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            result: Some(ApplyOutcome::Error),
            error_kind: Some(err.kind().to_string()),
            error_message: Some(err.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.state.append(&record) {
            tracing::warn!(error = %e, "Failed to record sync failure");
        }
        err
    }

    fn record_canceled(&self, run: &Run) {
        let record = HistoryRecord {
            dataset: run.dataset.clone(),
            from_version: run.current_version.clone(),
            to_version: run.target_version.clone(),
            strategy: run.strategy,
            duration_ms: i64::try_from(run.started.elapsed().as_millis()).unwrap_or(i64::MAX),
            result: Some(ApplyOutcome::Canceled),
            error_kind: Some(SyncError::Canceled.kind().to_string()),
            error_message: Some(format!(
                "Canceled after {} applied step(s)",
                run.steps_applied
            )),
            ..Default::default()
        };
        if let Err(e) = self.state.append(&record) {
            tracing::warn!(error = %e, "Failed to record canceled sync");
        }
        self.bump(&run.dataset, |d| d.cancel_count += 1);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_ms;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter)).min(MAX_BACKOFF)
    }

    /// Best-effort refresh of derived tables after rows changed
    ///
    /// A snapshot rewrites the whole dataset, so the WAL is folded back too.
    async fn rebuild_indexes(&self, dataset: &str, replaced: bool) {
        let storage = self.storage.clone();
        let dataset = dataset.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let sets = storage.with_connection(|conn| {
                let sets = rebuild_set_summary(conn, &dataset)?;
                conn.execute_batch("ANALYZE catalog_records;")?;
                Ok(sets)
            })?;
            if replaced {
                storage.checkpoint()?;
            }
            Ok::<_, SyncError>(sets)
        })
        .await;

        match result {
            Ok(Ok(sets)) => tracing::debug!(sets, "Rebuilt set summary"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Index rebuild failed"),
            Err(e) => tracing::warn!(error = %e, "Index rebuild task failed"),
        }
    }

    async fn finish(&self, run: Run, end: RunEnd) {
        let (outcome, error) = match end {
            RunEnd::Synced => (SyncOutcome::Synced, None),
            RunEnd::UpToDate => (SyncOutcome::UpToDate, None),
            RunEnd::Canceled => (SyncOutcome::Canceled, None),
            RunEnd::Failed(err) => {
                let outcome = if err.is_soft() || matches!(err, SyncError::VersionConflict { .. }) {
                    SyncOutcome::Retryable
                } else {
                    SyncOutcome::Failed
                };
                (outcome, Some(err))
            }
        };

        if run.steps_applied > 0 {
            if outcome == SyncOutcome::Synced {
                self.set_phase(&run, SyncPhase::RebuildingIndexes);
            }
            self.rebuild_indexes(&run.dataset, run.strategy == Some(Strategy::Full))
                .await;
        }

        let final_phase = match outcome {
            SyncOutcome::Synced | SyncOutcome::UpToDate => SyncPhase::Complete,
            SyncOutcome::Canceled => SyncPhase::Canceled,
            SyncOutcome::Retryable | SyncOutcome::Failed => SyncPhase::Failed,
        };

        let duration_ms = i64::try_from(run.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let report = SyncReport {
            run_id: run.run_id.clone(),
            dataset: run.dataset.clone(),
            outcome,
            strategy: run.strategy,
            reason: run.reason,
            from_version: run.initial_version.clone(),
            current_version: run.current_version.clone(),
            target_version: run.target_version.clone(),
            steps_applied: run.steps_applied,
            attempts: run.attempts,
            duration_ms,
            error_kind: error.as_ref().map(|e| e.kind().to_string()),
            error: error.as_ref().map(|e| e.to_string()),
        };

        self.bump(&run.dataset, |d| {
            d.last_outcome = Some(outcome);
            d.last_strategy = run.strategy;
            d.last_duration_ms = Some(duration_ms);
            d.last_error = report.error.clone();
            d.last_finished_at = Some(Utc::now());
        });

        if let Err(e) = self
            .storage
            .with_connection(|conn| finish_run(conn, &run.dataset, &run.run_id))
        {
            tracing::warn!(error = %e, "Failed to clear run marker");
        }

        match &error {
            None => tracing::info!(
                dataset = %run.dataset,
                run_id = %run.run_id,
                outcome = %outcome,
                steps = run.steps_applied,
                duration_ms,
                "Sync finished"
            ),
            Some(err) => tracing::error!(
                dataset = %run.dataset,
                run_id = %run.run_id,
                outcome = %outcome,
                error = %err,
                "Sync failed"
            ),
        }

        run.status.send_modify(|s| {
            s.phase = final_phase;
            s.report = Some(report);
        });

        let mut registry = self.registry.lock();
        if registry
            .get(&run.dataset)
            .map(|entry| entry.run_id == run.run_id)
            .unwrap_or(false)
        {
            registry.remove(&run.dataset);
        }
    }
}
