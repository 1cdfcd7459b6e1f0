//! Persisted progress snapshot of one migration run.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, Local, Utc};
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A RUNNING snapshot not updated for this long belongs to a dead process.
pub const STALE_AFTER: chrono::Duration = chrono::Duration::minutes(5);

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Initializing,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Initializing => "INITIALIZING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Paused => "PAUSED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Run phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Preparing,
    Connecting,
    PreProcessing,
    ExtractingVariables,
    Deleting,
    Migrating,
    PostProcessing,
}

impl Phase {
    pub fn description(self) -> &'static str {
        match self {
            Phase::Preparing => "Loading plan and progress state",
            Phase::Connecting => "Connecting to databases",
            Phase::PreProcessing => "Running global pre-processing",
            Phase::ExtractingVariables => "Extracting dynamic variables",
            Phase::Deleting => "Deleting target rows in foreign key order",
            Phase::Migrating => "Migrating queries",
            Phase::PostProcessing => "Running global post-processing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-query status. Only PENDING → RUNNING → COMPLETED | FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Pending => "PENDING",
            QueryStatus::Running => "RUNNING",
            QueryStatus::Completed => "COMPLETED",
            QueryStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    /// Error kind name, e.g. `QueryExecutionError`.
    pub kind: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn from_error(err: &MigrateError) -> Self {
        Self {
            at: Utc::now(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRecord {
    pub description: String,
    pub target_table: String,
    pub status: QueryStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub deleted_rows: u64,
    pub inserted_rows: u64,
    pub current_batch: usize,
    pub total_batches: usize,
    pub rows_per_second: f64,
    pub eta_seconds: Option<f64>,
    pub retry_count: u32,
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub total_queries: usize,
    pub completed_queries: usize,
    pub failed_queries: usize,
    pub total_rows: u64,
    pub processed_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Performance {
    pub rows_per_second: f64,
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeInfo {
    pub resume_count: u32,
    pub resumed_at: Option<DateTime<Utc>>,
}

/// Everything needed to report on and resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default = "current_version")]
    pub version: u32,

    pub migration_id: String,

    /// SHA256 of the plan; also the HMAC key.
    #[serde(default)]
    pub plan_hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,

    #[serde(default)]
    pub status: RunStatus,

    #[serde(default)]
    pub current_phase: Option<Phase>,

    #[serde(default)]
    pub phases: Vec<PhaseRecord>,

    /// Query records in plan order.
    #[serde(default)]
    pub queries: IndexMap<String, QueryRecord>,

    /// Errors not tied to a single query.
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,

    #[serde(default)]
    pub counters: Counters,

    #[serde(default)]
    pub performance: Performance,

    #[serde(default)]
    pub resume: ResumeInfo,

    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// HMAC-SHA256 over the snapshot without this field, keyed by `plan_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

fn current_version() -> u32 {
    SNAPSHOT_VERSION
}

/// New run id, `migration_YYYYMMDD_HHMMSS_mmm` in local time.
pub fn new_migration_id() -> String {
    Local::now().format("migration_%Y%m%d_%H%M%S_%3f").to_string()
}

/// HMAC-SHA256 of a snapshot document without its `hmac` member.
fn sign(mut document: serde_json::Value, key: &str) -> Result<String> {
    if let Some(fields) = document.as_object_mut() {
        fields.remove("hmac");
    }
    let content = serde_json::to_vec(&document)?;

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
    mac.update(&content);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// File holding the snapshot of `migration_id`.
pub fn snapshot_path(progress_dir: &Path, migration_id: &str) -> PathBuf {
    progress_dir.join(format!("{}.json", migration_id))
}

impl ProgressSnapshot {
    pub fn new(migration_id: String, plan_hash: String) -> Self {
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            migration_id,
            plan_hash,
            plan_name: None,
            status: RunStatus::Initializing,
            current_phase: None,
            phases: Vec::new(),
            queries: IndexMap::new(),
            errors: Vec::new(),
            counters: Counters::default(),
            performance: Performance::default(),
            resume: ResumeInfo::default(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let document = serde_json::to_value(self)
            .map_err(|e| MigrateError::State(format!("Failed to serialize snapshot for HMAC: {}", e)))?;
        sign(document, &self.plan_hash)
    }

    /// Load a snapshot, verifying its signature when one is present.
    ///
    /// The signature covers the JSON as stored, so fields this version does
    /// not know about are still verified before being dropped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::State(format!("cannot read {}: {}", path.display(), e))
        })?;
        let document: serde_json::Value = serde_json::from_str(&content)?;
        let snapshot = Self::deserialize(&document)?;

        match snapshot.hmac {
            Some(ref stored) => {
                if *stored != sign(document, &snapshot.plan_hash)? {
                    return Err(MigrateError::State(format!(
                        "{}: integrity check failed (HMAC mismatch)",
                        path.display()
                    )));
                }
            }
            None => warn!(
                "{} has no HMAC signature, integrity cannot be verified",
                path.display()
            ),
        }

        Ok(snapshot)
    }

    /// Sign and write atomically (temp file, then rename).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        self.hmac = Some(self.compute_hmac()?);
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Whether this run may be resumed at `now`.
    pub fn can_resume_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            RunStatus::Failed | RunStatus::Paused => true,
            RunStatus::Running | RunStatus::Initializing => now - self.updated_at > STALE_AFTER,
            RunStatus::Completed => false,
        }
    }

    pub fn can_resume(&self) -> bool {
        self.can_resume_at(Utc::now())
    }

    /// Reset unfinished queries for another attempt. COMPLETED records are
    /// untouched; FAILED and interrupted RUNNING records go back to PENDING
    /// with their errors kept and `retry_count` bumped.
    pub fn prepare_for_resume(&mut self) {
        let now = Utc::now();
        for record in self.queries.values_mut() {
            if matches!(record.status, QueryStatus::Failed | QueryStatus::Running) {
                record.status = QueryStatus::Pending;
                record.retry_count += 1;
                record.started_at = None;
                record.completed_at = None;
                record.processed_rows = 0;
                record.current_batch = 0;
                record.rows_per_second = 0.0;
                record.eta_seconds = None;
            }
        }
        self.resume.resume_count += 1;
        self.resume.resumed_at = Some(now);
        self.status = RunStatus::Running;
        self.completed_at = None;
        self.updated_at = now;
        self.refresh_counters();
    }

    /// Ensure a record exists for each query id, in the given order.
    pub fn register_queries<'q>(
        &mut self,
        queries: impl IntoIterator<Item = (&'q str, &'q str, &'q str)>,
    ) {
        for (id, description, target_table) in queries {
            self.queries
                .entry(id.to_string())
                .or_insert_with(|| QueryRecord {
                    description: description.to_string(),
                    target_table: target_table.to_string(),
                    ..Default::default()
                });
        }
        self.refresh_counters();
    }

    pub fn query_status(&self, id: &str) -> Option<QueryStatus> {
        self.queries.get(id).map(|q| q.status)
    }

    /// Recompute counters and the overall rate and ETA.
    pub fn refresh_counters(&mut self) {
        let mut c = Counters {
            total_queries: self.queries.len(),
            ..Default::default()
        };
        for q in self.queries.values() {
            match q.status {
                QueryStatus::Completed => c.completed_queries += 1,
                QueryStatus::Failed => c.failed_queries += 1,
                _ => {}
            }
            c.total_rows += q.total_rows;
            c.processed_rows += q.processed_rows;
        }

        let since = self.resume.resumed_at.unwrap_or(self.started_at);
        let elapsed = (Utc::now() - since).num_milliseconds() as f64 / 1000.0;
        self.performance = rate(c.processed_rows, c.total_rows, elapsed);
        self.counters = c;
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Record for `phase`, created on first use.
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        if let Some(idx) = self.phases.iter().position(|p| p.phase == phase) {
            return &mut self.phases[idx];
        }
        self.phases.push(PhaseRecord {
            phase,
            status: PhaseStatus::Pending,
            description: phase.description().to_string(),
            started_at: None,
            completed_at: None,
        });
        let last = self.phases.len() - 1;
        &mut self.phases[last]
    }
}

/// Rows per second and remaining seconds for `processed` of `total` rows.
pub fn rate(processed: u64, total: u64, elapsed_secs: f64) -> Performance {
    if elapsed_secs <= 0.0 || processed == 0 {
        return Performance::default();
    }
    let rows_per_second = processed as f64 / elapsed_secs;
    let remaining = total.saturating_sub(processed) as f64;
    Performance {
        rows_per_second,
        eta_seconds: (total > 0).then(|| remaining / rows_per_second),
    }
}

/// Every readable snapshot in `progress_dir`, newest first.
pub fn list(progress_dir: &Path) -> Result<Vec<ProgressSnapshot>> {
    if !progress_dir.exists() {
        return Ok(Vec::new());
    }
    let mut snapshots = Vec::new();
    for entry in std::fs::read_dir(progress_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match ProgressSnapshot::load(&path) {
            Ok(s) => snapshots.push(s),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    snapshots.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(snapshots)
}
