//! Execution of a single query: prepare, pre-process, fetch, delete, insert,
//! post-process.

use super::{QueryResult, RunContext};
use crate::config::{Config, DeleteStrategy, QuerySpec};
use crate::core::{RowSet, TableName};
use crate::db::{default_handle, ConnectionHandle, DatabaseSet};
use crate::deletion::ChunkedDeleter;
use crate::error::{MigrateError, Result};
use crate::progress::QueryStatus;
use crate::script::{validate_single_select, FailureMode, ScriptProcessor};
use crate::transfer::{expand_select_star, set_identity_insert, BatchWriter, InsertLayout};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source SQL ready to run, with the overrides that apply to it.
#[derive(Debug, Clone)]
pub(super) struct PreparedQuery {
    pub table: TableName,
    pub sql: String,
    pub overrides: Vec<(String, String)>,
}

/// Rows fetched and deleted ahead of the query, by the ordered deletion phase.
#[derive(Debug, Clone)]
pub(super) struct Prefetched {
    pub rows: RowSet,
    pub deleted: u64,
}

/// Everything a query needs from the run.
pub(super) struct QueryEnv<'a> {
    pub config: &'a Config,
    pub databases: &'a DatabaseSet,
    pub ctx: &'a RunContext,
    pub cancel: &'a CancellationToken,
}

impl QueryEnv<'_> {
    /// Substitute variables, expand `SELECT *` and pick column overrides.
    pub async fn prepare(&self, spec: &QuerySpec) -> Result<PreparedQuery> {
        let table = TableName::parse(&spec.target_table)
            .map_err(|e| MigrateError::query(&spec.id, e))?;

        let substituted = self.ctx.variables.substitute(spec.source_text());
        if !substituted.is_complete() {
            let message = format!(
                "unresolved placeholders: {}",
                substituted.unresolved.join(", ")
            );
            if self.config.settings.fail_on_unresolved {
                return Err(MigrateError::validation(&spec.id, message));
            }
            warn!("{}: {}", spec.id, message);
        }
        let mut sql = substituted.sql;

        let target = self.databases.target()?;
        let columns = match self.ctx.metadata.columns(target.as_ref(), &table).await {
            Ok(cols) => cols,
            Err(e) => {
                debug!("{}: no target metadata for {} ({})", spec.id, table, e);
                Vec::new()
            }
        };
        if let Some(expanded) = expand_select_star(&sql, &columns, spec.identity_insert)? {
            info!("{}: SELECT * expanded to the columns of {}", spec.id, table);
            sql = expanded;
        }

        let overrides = self
            .config
            .plan
            .column_overrides
            .iter()
            .filter(|(column, _)| spec.column_overrides.includes(column))
            .map(|(column, expr)| (column.clone(), self.ctx.variables.substitute(expr).sql))
            .collect();

        Ok(PreparedQuery {
            table,
            sql,
            overrides,
        })
    }

    /// Validate the prepared SQL and run it against the query's source database.
    pub async fn fetch(&self, spec: &QuerySpec, prepared: &PreparedQuery) -> Result<RowSet> {
        validate_single_select(&spec.id, &prepared.sql)?;

        let db = self.databases.get(&spec.source_database)?;
        let start = Instant::now();
        let rows = db
            .query(ConnectionHandle::Pooled, &prepared.sql, &[])
            .await
            .map_err(|e| MigrateError::query(&spec.id, format!("source fetch failed: {}", e)))?;
        info!(
            "{}: fetched {} rows from {} in {:.1}s",
            spec.id,
            rows.len(),
            db.name(),
            start.elapsed().as_secs_f64()
        );
        Ok(rows)
    }

    /// Run one query end to end. The caller marks it COMPLETED.
    pub async fn run(&self, spec: &QuerySpec, prefetched: Option<Prefetched>) -> Result<QueryResult> {
        let start = Instant::now();
        let progress = &self.ctx.progress;
        progress.start_query(&spec.id)?;
        info!("{}: starting ({})", spec.id, spec.description);

        let prepared = self.prepare(spec).await?;
        let scripts = ScriptProcessor::new(self.databases, &self.ctx.metadata);

        if let Some(ref group) = spec.pre_process {
            scripts
                .run_group(group, &self.ctx.variables, FailureMode::Fatal)
                .await?;
            self.ctx.metadata.clear();
        }

        let (rows, mut deleted) = match prefetched {
            Some(p) => (p.rows, p.deleted),
            None => (self.fetch(spec, &prepared).await?, 0),
        };

        let batch_size = spec
            .batch_size
            .unwrap_or(self.config.settings.default_batch_size)
            .max(1);
        progress.set_query_totals(&spec.id, rows.len() as u64, rows.len().div_ceil(batch_size))?;

        let target = self.databases.target()?;
        if spec.delete_before_insert
            && self.config.settings.delete_strategy == DeleteStrategy::PerQuery
        {
            let outcome = ChunkedDeleter::new(
                target.as_ref(),
                &self.ctx.metadata,
                default_handle(target.as_ref()),
            )
            .delete_matching(&spec.id, &prepared.table, &spec.identity_columns, &rows)
            .await?;
            progress.record_delete(&spec.id, outcome.rows_deleted)?;
            deleted = outcome.rows_deleted;
        }

        let inserted = if rows.is_empty() {
            info!("{}: source returned no rows", spec.id);
            0
        } else {
            let layout = InsertLayout::build(spec, &rows, &prepared.overrides)?;
            self.insert(spec, &prepared.table, &layout, &rows, batch_size)
                .await?
        };

        if let Some(ref group) = spec.post_process {
            match scripts
                .run_group(group, &self.ctx.variables, FailureMode::Continue)
                .await
            {
                Ok(outcome) if outcome.failed > 0 => warn!(
                    "{}: post-process {} had {} failed statement(s)",
                    spec.id, group.id, outcome.failed
                ),
                Ok(_) => {}
                Err(e) => warn!("{}: post-process {} failed: {}", spec.id, group.id, e),
            }
        }

        Ok(QueryResult {
            query_id: spec.id.clone(),
            target_table: spec.target_table.clone(),
            status: QueryStatus::Completed,
            rows_fetched: rows.len() as u64,
            rows_deleted: deleted,
            rows_inserted: inserted,
            duration_seconds: start.elapsed().as_secs_f64(),
            error: None,
        })
    }

    /// Batched insert, on a session with IDENTITY_INSERT when requested.
    async fn insert(
        &self,
        spec: &QuerySpec,
        table: &TableName,
        layout: &InsertLayout,
        rows: &RowSet,
        batch_size: usize,
    ) -> Result<u64> {
        let target = self.databases.target()?;
        let db = target.as_ref();

        let (handle, reserved) = if spec.identity_insert {
            (ConnectionHandle::Session, db.begin_session().await?)
        } else {
            (default_handle(db), false)
        };

        let written = async {
            if spec.identity_insert {
                set_identity_insert(db, table, true).await?;
            }
            let stats = BatchWriter::new(db, handle, batch_size)
                .write(&spec.id, table, layout, rows, |batch, n| {
                    self.ctx.progress.record_batch(&spec.id, batch, n)?;
                    if self.cancel.is_cancelled() {
                        return Err(MigrateError::Cancelled);
                    }
                    Ok(())
                })
                .await;
            if spec.identity_insert {
                if let Err(e) = set_identity_insert(db, table, false).await {
                    warn!("{}: resetting IDENTITY_INSERT failed: {}", spec.id, e);
                }
            }
            stats
        }
        .await;

        if reserved {
            db.end_session().await?;
        }
        Ok(written?.rows)
    }
}
