//! Run results reported to the caller.

use crate::error::Result;
use crate::progress::{QueryStatus, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one query in this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub target_table: String,
    pub status: QueryStatus,
    pub rows_fetched: u64,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn failed(query_id: &str, target_table: &str, error: String, duration_seconds: f64) -> Self {
        Self {
            query_id: query_id.to_string(),
            target_table: target_table.to_string(),
            status: QueryStatus::Failed,
            rows_fetched: 0,
            rows_deleted: 0,
            rows_inserted: 0,
            duration_seconds,
            error: Some(error),
        }
    }
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// True when the run finished COMPLETED.
    pub success: bool,

    pub status: RunStatus,

    pub migration_id: String,

    /// Snapshot file of this run.
    pub progress_file: PathBuf,

    /// Rows inserted across all queries of this run.
    pub total_processed: u64,

    pub success_count: usize,

    pub failure_count: usize,

    /// Queries already COMPLETED by an earlier attempt and not re-run.
    pub skipped_count: usize,

    pub per_query_results: Vec<QueryResult>,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_seconds: f64,
}

impl RunSummary {
    /// Convert the summary to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Offline check of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCheck {
    pub query_id: String,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Placeholders no static, built-in or environment value resolves and
    /// no dynamic variable is declared for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<String>,
}

/// Result of validating a plan without connecting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub plan_name: Option<String>,
    pub plan_hash: String,
    pub queries: Vec<QueryCheck>,
    pub dynamic_variables: usize,
    pub pre_process_groups: usize,
    pub post_process_groups: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.queries.iter().all(|q| q.valid)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of one configured database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub database: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
