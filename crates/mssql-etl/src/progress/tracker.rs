//! Shared, self-persisting progress tracker for a running migration.

use super::snapshot::{
    new_migration_id, rate, snapshot_path, ErrorRecord, Phase, PhaseStatus, ProgressSnapshot,
    QueryRecord, QueryStatus, RunStatus,
};
use crate::config::QuerySpec;
use crate::error::{MigrateError, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the run's snapshot. Every mutating call saves it; an optional
/// background task also saves on a fixed interval through the same lock.
pub struct ProgressTracker {
    snapshot: Arc<Mutex<ProgressSnapshot>>,
    path: PathBuf,
    autosave: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ProgressTracker {
    /// Start tracking a new run with every query PENDING.
    pub fn create(
        progress_dir: &Path,
        plan_hash: &str,
        plan_name: Option<&str>,
        queries: &[&QuerySpec],
    ) -> Result<Self> {
        let migration_id = new_migration_id();
        let mut snapshot = ProgressSnapshot::new(migration_id.clone(), plan_hash.to_string());
        snapshot.plan_name = plan_name.map(str::to_string);
        snapshot.register_queries(
            queries
                .iter()
                .map(|q| (q.id.as_str(), q.description.as_str(), q.target_table.as_str())),
        );

        let tracker = Self::with_snapshot(snapshot, snapshot_path(progress_dir, &migration_id));
        tracker.save()?;
        info!("Tracking migration {} in {}", migration_id, tracker.path.display());
        Ok(tracker)
    }

    /// Reload an interrupted run and reset its unfinished queries.
    pub fn resume(
        progress_dir: &Path,
        migration_id: &str,
        plan_hash: &str,
        queries: &[&QuerySpec],
    ) -> Result<Self> {
        let path = snapshot_path(progress_dir, migration_id);
        if !path.exists() {
            return Err(MigrateError::State(format!(
                "no progress file for migration {} in {}",
                migration_id,
                progress_dir.display()
            )));
        }
        let mut snapshot = ProgressSnapshot::load(&path)?;

        if !snapshot.can_resume() {
            return Err(MigrateError::State(format!(
                "migration {} is {:?} and cannot be resumed",
                migration_id, snapshot.status
            )));
        }
        if snapshot.plan_hash != plan_hash {
            warn!(
                "Plan changed since migration {} started, resuming against the current plan",
                migration_id
            );
            snapshot.plan_hash = plan_hash.to_string();
        }

        snapshot.prepare_for_resume();
        snapshot.register_queries(
            queries
                .iter()
                .map(|q| (q.id.as_str(), q.description.as_str(), q.target_table.as_str())),
        );
        info!(
            "Resuming migration {} (attempt {}), {} of {} queries already completed",
            migration_id,
            snapshot.resume.resume_count + 1,
            snapshot.counters.completed_queries,
            snapshot.counters.total_queries
        );

        let tracker = Self::with_snapshot(snapshot, path);
        tracker.save()?;
        Ok(tracker)
    }

    fn with_snapshot(snapshot: ProgressSnapshot, path: PathBuf) -> Self {
        Self {
            snapshot: Arc::new(Mutex::new(snapshot)),
            path,
            autosave: None,
        }
    }

    /// Save every `interval` until [`ProgressTracker::finish`] or drop.
    /// Must be called from within a tokio runtime.
    pub fn start_autosave(&mut self, interval: Duration) {
        if self.autosave.is_some() || interval.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        let snapshot = Arc::clone(&self.snapshot);
        let path = self.path.clone();
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut guard = lock(&snapshot);
                        guard.refresh_counters();
                        match guard.save(&path) {
                            Ok(()) => debug!("Progress saved to {}", path.display()),
                            Err(e) => warn!("Periodic progress save failed: {}", e),
                        }
                    }
                }
            }
        });
        self.autosave = Some((token, handle));
    }

    fn stop_autosave(&mut self) {
        if let Some((token, handle)) = self.autosave.take() {
            token.cancel();
            handle.abort();
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migration_id(&self) -> String {
        lock(&self.snapshot).migration_id.clone()
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.snapshot).clone()
    }

    pub fn query_status(&self, id: &str) -> Option<QueryStatus> {
        lock(&self.snapshot).query_status(id)
    }

    fn save(&self) -> Result<()> {
        lock(&self.snapshot).save(&self.path)
    }

    /// Apply a change, refresh derived fields and persist.
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ProgressSnapshot),
    {
        let mut guard = lock(&self.snapshot);
        f(&mut guard);
        guard.updated_at = Utc::now();
        guard.refresh_counters();
        guard.save(&self.path)
    }

    fn update_query<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut QueryRecord),
    {
        self.update(|s| match s.queries.get_mut(id) {
            Some(record) => f(record),
            None => warn!("Progress update for unknown query {}", id),
        })
    }

    pub fn set_status(&self, status: RunStatus) -> Result<()> {
        self.update(|s| s.status = status)
    }

    pub fn start_phase(&self, phase: Phase) -> Result<()> {
        debug!("Phase {:?} started", phase);
        self.update(|s| {
            s.current_phase = Some(phase);
            let record = s.phase_mut(phase);
            record.status = PhaseStatus::Running;
            record.started_at = Some(Utc::now());
            record.completed_at = None;
        })
    }

    pub fn complete_phase(&self, phase: Phase) -> Result<()> {
        self.end_phase(phase, PhaseStatus::Completed)
    }

    pub fn skip_phase(&self, phase: Phase) -> Result<()> {
        self.end_phase(phase, PhaseStatus::Skipped)
    }

    /// Mark `phase` failed and record `err` as a run-level error.
    pub fn fail_phase(&self, phase: Phase, err: &MigrateError) -> Result<()> {
        let record = ErrorRecord::from_error(err);
        self.update(|s| {
            let p = s.phase_mut(phase);
            p.status = PhaseStatus::Failed;
            p.completed_at = Some(Utc::now());
            s.errors.push(record);
        })
    }

    /// Close `phase` with the given status.
    pub fn end_phase(&self, phase: Phase, status: PhaseStatus) -> Result<()> {
        debug!("Phase {:?} {:?}", phase, status);
        self.update(|s| {
            let p = s.phase_mut(phase);
            p.status = status;
            p.completed_at = Some(Utc::now());
        })
    }

    /// Run-level error not tied to a query or phase.
    pub fn record_error(&self, err: &MigrateError) -> Result<()> {
        let record = ErrorRecord::from_error(err);
        self.update(|s| s.errors.push(record))
    }

    /// PENDING → RUNNING. A query already RUNNING (rows fetched in the
    /// deletion phase) keeps its counters.
    pub fn start_query(&self, id: &str) -> Result<()> {
        self.update_query(id, |q| {
            if q.status == QueryStatus::Running {
                return;
            }
            q.status = QueryStatus::Running;
            q.started_at = Some(Utc::now());
            q.completed_at = None;
            q.processed_rows = 0;
            q.inserted_rows = 0;
            q.deleted_rows = 0;
            q.current_batch = 0;
        })
    }

    /// Row estimate and batch count once known.
    pub fn set_query_totals(&self, id: &str, total_rows: u64, total_batches: usize) -> Result<()> {
        self.update_query(id, |q| {
            q.total_rows = total_rows;
            q.total_batches = total_batches;
        })
    }

    pub fn record_delete(&self, id: &str, deleted: u64) -> Result<()> {
        self.update_query(id, |q| q.deleted_rows += deleted)
    }

    /// One batch of `rows` written.
    pub fn record_batch(&self, id: &str, batch: usize, rows: u64) -> Result<()> {
        self.update_query(id, |q| {
            q.current_batch = batch;
            q.processed_rows += rows;
            q.inserted_rows += rows;
            let elapsed = q
                .started_at
                .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0);
            let perf = rate(q.processed_rows, q.total_rows, elapsed);
            q.rows_per_second = perf.rows_per_second;
            q.eta_seconds = perf.eta_seconds;
        })
    }

    pub fn complete_query(&self, id: &str) -> Result<()> {
        self.update_query(id, |q| {
            q.status = QueryStatus::Completed;
            q.completed_at = Some(Utc::now());
            q.total_rows = q.total_rows.max(q.processed_rows);
            q.eta_seconds = None;
        })
    }

    pub fn fail_query(&self, id: &str, err: &MigrateError) -> Result<()> {
        let record = ErrorRecord::from_error(err);
        self.update_query(id, |q| {
            q.status = QueryStatus::Failed;
            q.completed_at = Some(Utc::now());
            q.eta_seconds = None;
            q.errors.push(record);
        })
    }

    /// Stop the autosave task, set the final status and save once more.
    pub fn finish(&mut self, status: RunStatus) -> Result<ProgressSnapshot> {
        self.stop_autosave();
        self.update(|s| {
            s.status = status;
            s.current_phase = None;
            if status != RunStatus::Paused {
                s.completed_at = Some(Utc::now());
            }
        })?;
        Ok(self.snapshot())
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop_autosave();
    }
}

fn lock(m: &Mutex<ProgressSnapshot>) -> MutexGuard<'_, ProgressSnapshot> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
