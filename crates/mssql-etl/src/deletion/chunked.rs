//! Delete target rows whose primary key matches the fetched source rows.
//!
//! SQL Server accepts at most 2100 parameters per statement. Keys are bound
//! as `@P` parameters in chunks of `MAX_PARAMETERS / key_columns` tuples.

use crate::core::{quote_ident, RowSet, SqlValue, TableName};
use crate::db::{ConnectionHandle, Database, MetadataCache};
use crate::error::{MigrateError, Result};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Parameter ceiling per DELETE statement.
pub const MAX_PARAMETERS: usize = 2000;

/// What a chunked delete did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub chunks: usize,
    pub rows_deleted: u64,
    /// Distinct key tuples taken from the source rows.
    pub keys: usize,
    /// No usable keys, nothing was sent.
    pub skipped: bool,
    pub empty_chunks: usize,
    pub diagnostics: Vec<String>,
}

/// Chunked PK-matching deleter for one target database.
pub struct ChunkedDeleter<'a> {
    db: &'a dyn Database,
    metadata: &'a MetadataCache,
    handle: ConnectionHandle,
    max_parameters: usize,
}

impl<'a> ChunkedDeleter<'a> {
    pub fn new(db: &'a dyn Database, metadata: &'a MetadataCache, handle: ConnectionHandle) -> Self {
        Self {
            db,
            metadata,
            handle,
            max_parameters: MAX_PARAMETERS,
        }
    }

    pub fn with_max_parameters(mut self, max_parameters: usize) -> Self {
        self.max_parameters = max_parameters.max(1);
        self
    }

    /// Delete rows of `table` whose `key_columns` match a row in `rows`.
    pub async fn delete_matching(
        &self,
        query_id: &str,
        table: &TableName,
        key_columns: &[String],
        rows: &RowSet,
    ) -> Result<DeleteOutcome> {
        let mut outcome = DeleteOutcome::default();
        if key_columns.is_empty() {
            return Err(MigrateError::query(query_id, "no key columns for delete"));
        }

        let target_keys = self.resolve_target_columns(query_id, table, key_columns).await?;
        let keys = extract_keys(query_id, key_columns, rows)?;
        outcome.keys = keys.len();

        if keys.is_empty() {
            info!("{}: no key values in source rows, delete skipped", query_id);
            outcome.skipped = true;
            return Ok(outcome);
        }

        let quoted_table = table.quoted()?;
        let quoted_keys = target_keys
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Result<Vec<_>>>()?;
        let chunk_size = (self.max_parameters / quoted_keys.len()).max(1);

        for chunk in keys.chunks(chunk_size) {
            let sql = build_delete(&quoted_table, &quoted_keys, chunk.len());
            let params: Vec<SqlValue> = chunk.iter().flatten().cloned().collect();
            let deleted = self
                .db
                .execute(self.handle, &sql, &params)
                .await
                .map_err(|e| MigrateError::query(query_id, format!("delete failed: {}", e)))?;

            outcome.chunks += 1;
            outcome.rows_deleted += deleted;
            debug!(
                "{}: chunk {} deleted {} rows ({} total)",
                query_id, outcome.chunks, deleted, outcome.rows_deleted
            );

            if deleted == 0 {
                outcome.empty_chunks += 1;
                let note = self.diagnose(&quoted_table, outcome.chunks).await;
                warn!("{}: {}", query_id, note);
                outcome.diagnostics.push(note);
            }
        }

        info!(
            "{}: deleted {} rows in {} chunks ({} keys)",
            query_id, outcome.rows_deleted, outcome.chunks, outcome.keys
        );
        Ok(outcome)
    }

    /// Match key columns to the live table, case-insensitively.
    async fn resolve_target_columns(
        &self,
        query_id: &str,
        table: &TableName,
        key_columns: &[String],
    ) -> Result<Vec<String>> {
        let columns = match self.metadata.columns(self.db, table).await {
            Ok(cols) if !cols.is_empty() => cols,
            Ok(_) | Err(_) => {
                debug!("{}: no catalog columns for {}, using key names as given", query_id, table);
                return Ok(key_columns.to_vec());
            }
        };

        key_columns
            .iter()
            .map(|key| {
                if let Some(col) = columns.iter().find(|c| c.name == *key) {
                    return Ok(col.name.clone());
                }
                match columns.iter().find(|c| c.name.eq_ignore_ascii_case(key)) {
                    Some(col) => {
                        info!(
                            "{}: key column '{}' matched as '{}' on {}",
                            query_id, key, col.name, table
                        );
                        Ok(col.name.clone())
                    }
                    None => Err(MigrateError::query(
                        query_id,
                        format!("key column '{}' does not exist on {}", key, table),
                    )),
                }
            })
            .collect()
    }

    /// Explain a chunk that deleted nothing. Never fails.
    async fn diagnose(&self, quoted_table: &str, chunk: usize) -> String {
        let probe = format!("SELECT TOP 1 1 FROM {}", quoted_table);
        match self.db.query(self.handle, &probe, &[]).await {
            Ok(rs) if rs.is_empty() => {
                format!("chunk {} deleted 0 rows: {} is empty", chunk, quoted_table)
            }
            Ok(_) => format!(
                "chunk {} deleted 0 rows: {} has rows but none matched the keys",
                chunk, quoted_table
            ),
            Err(e) => format!("chunk {} deleted 0 rows: probe failed: {}", chunk, e),
        }
    }
}

/// Distinct non-NULL key tuples in first-seen order.
fn extract_keys(query_id: &str, key_columns: &[String], rows: &RowSet) -> Result<Vec<Vec<SqlValue>>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let indexes = key_columns
        .iter()
        .map(|k| {
            rows.column_index(k).ok_or_else(|| {
                MigrateError::query(
                    query_id,
                    format!("key column '{}' is not in the source rows", k),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for row in &rows.rows {
        let tuple: Option<Vec<SqlValue>> = indexes
            .iter()
            .map(|&i| row.get(i).filter(|v| !v.is_null()).cloned())
            .collect();
        let Some(tuple) = tuple else { continue };
        let id = tuple
            .iter()
            .map(SqlValue::dedup_key)
            .collect::<Vec<_>>()
            .join("\u{1f}");
        if seen.insert(id) {
            keys.push(tuple);
        }
    }
    Ok(keys)
}

/// `DELETE FROM t WHERE [k] IN (@P1, ...)` or, for composite keys,
/// `DELETE FROM t WHERE ([a] = @P1 AND [b] = @P2) OR ...`.
fn build_delete(quoted_table: &str, quoted_keys: &[String], tuples: usize) -> String {
    if let [key] = quoted_keys {
        let params = (1..=tuples)
            .map(|i| format!("@P{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        return format!("DELETE FROM {} WHERE {} IN ({})", quoted_table, key, params);
    }

    let width = quoted_keys.len();
    let predicates = (0..tuples)
        .map(|t| {
            let terms = quoted_keys
                .iter()
                .enumerate()
                .map(|(k, col)| format!("{} = @P{}", col, t * width + k + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            format!("({})", terms)
        })
        .collect::<Vec<_>>()
        .join(" OR ");
    format!("DELETE FROM {} WHERE {}", quoted_table, predicates)
}
