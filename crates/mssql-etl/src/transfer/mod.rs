//! Target writes for one query: column layout, `SELECT *` expansion, row
//! estimates and batched parameterized INSERTs.
//!
//! Rows are written in batches of `batch_size`. Each batch is sent as one or
//! more multi-row `INSERT ... VALUES` statements, kept under both the
//! parameter ceiling and SQL Server's 1000-row table value constructor limit.

use crate::config::QuerySpec;
use crate::core::{quote_ident, RowSet, SqlValue, TableName};
use crate::db::{ColumnInfo, ConnectionHandle, Database};
use crate::deletion::MAX_PARAMETERS;
use crate::error::{MigrateError, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maximum rows in one `VALUES` list.
pub const MAX_VALUES_ROWS: usize = 1000;

static SELECT_STAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(\s*SELECT\s+(?:DISTINCT\s+)?(?:TOP\s*\(?\s*\d+\s*\)?\s+(?:PERCENT\s+)?)?)\*(\s+FROM\b)")
        .expect("select star pattern")
});

/// Where one insert column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// Index into the fetched row, bound as a parameter.
    Field(usize),
    /// SQL expression inlined into every VALUES row.
    Expression(String),
}

/// Target columns of an insert and the source of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertLayout {
    pub columns: Vec<String>,
    pub sources: Vec<ColumnSource>,
}

impl InsertLayout {
    /// Map fetched columns onto target columns, then apply overrides.
    ///
    /// Explicit `target_columns` map to the fetched columns by position; when
    /// absent the fetched column names are used. An override replaces the
    /// value of an existing column or adds a new one.
    pub fn build(spec: &QuerySpec, rows: &RowSet, overrides: &[(String, String)]) -> Result<Self> {
        let columns: Vec<String> = if spec.target_columns.is_empty() {
            rows.columns.clone()
        } else if spec.target_columns.len() == rows.columns.len() {
            spec.target_columns.clone()
        } else {
            return Err(MigrateError::query(
                &spec.id,
                format!(
                    "{} target columns configured but the query returned {}",
                    spec.target_columns.len(),
                    rows.columns.len()
                ),
            ));
        };

        let mut layout = Self {
            sources: (0..columns.len()).map(ColumnSource::Field).collect(),
            columns,
        };

        for (column, expression) in overrides {
            match layout
                .columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(column))
            {
                Some(idx) => layout.sources[idx] = ColumnSource::Expression(expression.clone()),
                None => {
                    layout.columns.push(column.clone());
                    layout.sources.push(ColumnSource::Expression(expression.clone()));
                }
            }
            debug!("{}: column {} overridden with {}", spec.id, column, expression);
        }

        if layout.columns.is_empty() {
            return Err(MigrateError::query(&spec.id, "no columns to insert"));
        }
        Ok(layout)
    }

    /// Parameters bound per row.
    pub fn params_per_row(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| matches!(s, ColumnSource::Field(_)))
            .count()
    }

    /// Rows per INSERT statement under the parameter and VALUES limits.
    pub fn rows_per_statement(&self, max_parameters: usize) -> usize {
        match self.params_per_row() {
            0 => MAX_VALUES_ROWS,
            n => (max_parameters / n).clamp(1, MAX_VALUES_ROWS),
        }
    }

    /// `INSERT` for `row_count` rows; parameters numbered from `@P1`.
    pub fn build_insert(&self, quoted_table: &str, row_count: usize) -> Result<String> {
        let cols = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;

        let mut param = 0;
        let groups: Vec<String> = (0..row_count)
            .map(|_| {
                let values: Vec<String> = self
                    .sources
                    .iter()
                    .map(|s| match s {
                        ColumnSource::Field(_) => {
                            param += 1;
                            format!("@P{}", param)
                        }
                        ColumnSource::Expression(e) => e.clone(),
                    })
                    .collect();
                format!("({})", values.join(", "))
            })
            .collect();

        Ok(format!(
            "INSERT INTO {} ({}) VALUES {}",
            quoted_table,
            cols.join(", "),
            groups.join(", ")
        ))
    }

    fn bind(&self, row: &[SqlValue], params: &mut Vec<SqlValue>) {
        for source in &self.sources {
            if let ColumnSource::Field(i) = source {
                params.push(row.get(*i).cloned().unwrap_or(SqlValue::Null));
            }
        }
    }
}

/// Totals of one batched insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub batches: usize,
    pub statements: usize,
    pub rows: u64,
    pub write_time: Duration,
}

/// Batched INSERT writer for one target database.
pub struct BatchWriter<'a> {
    db: &'a dyn Database,
    handle: ConnectionHandle,
    batch_size: usize,
    max_parameters: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(db: &'a dyn Database, handle: ConnectionHandle, batch_size: usize) -> Self {
        Self {
            db,
            handle,
            batch_size: batch_size.max(1),
            max_parameters: MAX_PARAMETERS,
        }
    }

    pub fn with_max_parameters(mut self, max_parameters: usize) -> Self {
        self.max_parameters = max_parameters.max(1);
        self
    }

    /// Number of batches `rows` will be written in.
    pub fn batch_count(&self, rows: usize) -> usize {
        rows.div_ceil(self.batch_size)
    }

    /// Write every row. `on_batch(batch_number, rows_in_batch)` runs after
    /// each batch and may stop the write by returning an error.
    pub async fn write<F>(
        &self,
        query_id: &str,
        table: &TableName,
        layout: &InsertLayout,
        rows: &RowSet,
        mut on_batch: F,
    ) -> Result<InsertStats>
    where
        F: FnMut(usize, u64) -> Result<()>,
    {
        let mut stats = InsertStats::default();
        if rows.is_empty() {
            info!("{}: no rows to insert", query_id);
            return Ok(stats);
        }

        let quoted_table = table.quoted()?;
        let per_statement = layout.rows_per_statement(self.max_parameters);
        let start = Instant::now();

        for (b, batch) in rows.rows.chunks(self.batch_size).enumerate() {
            for part in batch.chunks(per_statement) {
                let sql = layout.build_insert(&quoted_table, part.len())?;
                let mut params = Vec::with_capacity(part.len() * layout.params_per_row());
                for row in part {
                    layout.bind(row, &mut params);
                }
                self.db.execute(self.handle, &sql, &params).await.map_err(|e| {
                    MigrateError::query(
                        query_id,
                        format!("insert into {} failed in batch {}: {}", table, b + 1, e),
                    )
                })?;
                stats.statements += 1;
            }
            stats.batches += 1;
            stats.rows += batch.len() as u64;
            debug!(
                "{}: batch {} wrote {} rows ({} total)",
                query_id,
                b + 1,
                batch.len(),
                stats.rows
            );
            on_batch(b + 1, batch.len() as u64)?;
        }

        stats.write_time = start.elapsed();
        info!(
            "{}: inserted {} rows into {} in {} batches ({:.1}s)",
            query_id,
            stats.rows,
            table,
            stats.batches,
            stats.write_time.as_secs_f64()
        );
        Ok(stats)
    }
}

/// Replace a leading `SELECT *` with the target's insertable columns.
/// Identity columns are kept only for identity-insert queries. Returns `None`
/// when the query has no bare `*` select list or the table is unknown.
pub fn expand_select_star(
    sql: &str,
    target_columns: &[ColumnInfo],
    include_identity: bool,
) -> Result<Option<String>> {
    let Some(caps) = SELECT_STAR.captures(sql) else {
        return Ok(None);
    };
    let mut columns: Vec<&ColumnInfo> = target_columns
        .iter()
        .filter(|c| include_identity || !c.is_identity)
        .collect();
    if columns.is_empty() {
        return Ok(None);
    }
    columns.sort_by_key(|c| c.ordinal);

    let list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    let (Some(head), Some(tail)) = (caps.get(1), caps.get(2)) else {
        return Ok(None);
    };
    Ok(Some(format!(
        "{}{}{}{}",
        head.as_str(),
        list,
        tail.as_str(),
        &sql[tail.end()..]
    )))
}

/// Best-effort row count of a source query: `COUNT_BIG(*)` over the query
/// as a derived table, falling back to running it and counting rows.
pub async fn estimate_rows(db: &dyn Database, query_id: &str, sql: &str) -> Result<u64> {
    let inner = sql.trim().trim_end_matches(';');
    let count_sql = format!("SELECT COUNT_BIG(*) AS row_count FROM ({}) AS src", inner);

    match db.query(ConnectionHandle::Pooled, &count_sql, &[]).await {
        Ok(rs) => {
            if let Some(n) = rs.rows.first().and_then(|r| r.first()).and_then(as_count) {
                return Ok(n);
            }
            warn!("{}: row count returned no value, counting rows instead", query_id);
        }
        Err(e) => debug!("{}: COUNT_BIG form failed ({}), counting rows instead", query_id, e),
    }

    let rows = db.query(ConnectionHandle::Pooled, sql, &[]).await?;
    Ok(rows.len() as u64)
}

fn as_count(value: &SqlValue) -> Option<u64> {
    match value {
        SqlValue::I64(n) => u64::try_from(*n).ok(),
        SqlValue::Decimal(d) => d.to_string().parse().ok(),
        SqlValue::Text(s) => s.parse().ok(),
        _ => None,
    }
}

/// `SET IDENTITY_INSERT` for `table` on the session connection.
pub async fn set_identity_insert(db: &dyn Database, table: &TableName, on: bool) -> Result<()> {
    let sql = format!(
        "SET IDENTITY_INSERT {} {}",
        table.quoted()?,
        if on { "ON" } else { "OFF" }
    );
    db.execute(ConnectionHandle::Session, &sql, &[]).await?;
    debug!("IDENTITY_INSERT {} on {}", if on { "ON" } else { "OFF" }, table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::{FakeDatabase, FakeResponse};

    fn spec(target_columns: &[&str]) -> QuerySpec {
        let mut spec: QuerySpec =
            serde_yaml::from_str("id: q1\nsource_query: SELECT 1\ntarget_table: dbo.Dest\n").unwrap();
        spec.target_columns = target_columns.iter().map(|c| c.to_string()).collect();
        spec
    }

    fn rows(n: i64) -> RowSet {
        RowSet::new(
            vec!["id".into(), "name".into()],
            (0..n)
                .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("n{}", i))])
                .collect(),
        )
    }

    fn col(name: &str, ordinal: i32, is_identity: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: "int".into(),
            nullable: false,
            is_identity,
            ordinal,
        }
    }

    #[test]
    fn test_layout_positional_target_columns() {
        let layout = InsertLayout::build(&spec(&["Id", "Name"]), &rows(1), &[]).unwrap();
        assert_eq!(layout.columns, vec!["Id", "Name"]);
        assert!(InsertLayout::build(&spec(&["Id"]), &rows(1), &[]).is_err());
    }

    #[test]
    fn test_overrides_replace_and_append() {
        let overrides = vec![
            ("NAME".to_string(), "'redacted'".to_string()),
            ("LoadedAt".to_string(), "GETDATE()".to_string()),
        ];
        let layout = InsertLayout::build(&spec(&[]), &rows(2), &overrides).unwrap();
        assert_eq!(layout.columns, vec!["id", "name", "LoadedAt"]);
        assert_eq!(layout.params_per_row(), 1);
        assert_eq!(
            layout.build_insert("[dbo].[Dest]", 2).unwrap(),
            "INSERT INTO [dbo].[Dest] ([id], [name], [LoadedAt]) VALUES (@P1, 'redacted', GETDATE()), (@P2, 'redacted', GETDATE())"
        );
    }

    #[test]
    fn test_rows_per_statement_limits() {
        let layout = InsertLayout::build(&spec(&[]), &rows(1), &[]).unwrap();
        assert_eq!(layout.rows_per_statement(2000), 1000);
        assert_eq!(layout.rows_per_statement(10), 5);
        assert_eq!(layout.rows_per_statement(1), 1);
    }

    #[tokio::test]
    async fn test_write_batches_and_reports_progress() {
        let db = FakeDatabase::new("target");
        let layout = InsertLayout::build(&spec(&[]), &rows(5), &[]).unwrap();
        let table = TableName::parse("dbo.Dest").unwrap();
        let mut progress = Vec::new();

        let stats = BatchWriter::new(&db, ConnectionHandle::Pooled, 2)
            .write("q1", &table, &layout, &rows(5), |b, n| {
                progress.push((b, n));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(progress, vec![(1, 2), (2, 2), (3, 1)]);
        assert_eq!((stats.batches, stats.statements, stats.rows), (3, 3, 5));
        let inserts = db.statements_matching("INSERT INTO");
        assert_eq!(inserts[0].params.len(), 4);
        assert_eq!(inserts[2].params, vec![SqlValue::I64(4), SqlValue::Text("n4".into())]);
    }

    #[tokio::test]
    async fn test_batch_split_under_parameter_ceiling() {
        let db = FakeDatabase::new("target");
        let layout = InsertLayout::build(&spec(&[]), &rows(10), &[]).unwrap();
        let table = TableName::parse("Dest").unwrap();

        let stats = BatchWriter::new(&db, ConnectionHandle::Pooled, 10)
            .with_max_parameters(6)
            .write("q1", &table, &layout, &rows(10), |_, _| Ok(()))
            .await
            .unwrap();
        assert_eq!((stats.batches, stats.statements), (1, 4));
    }

    #[tokio::test]
    async fn test_insert_failure_is_query_error() {
        let db = FakeDatabase::new("target");
        db.on("INSERT", FakeResponse::Fail("Violation of PRIMARY KEY".into()));
        let layout = InsertLayout::build(&spec(&[]), &rows(1), &[]).unwrap();
        let table = TableName::parse("Dest").unwrap();

        let err = BatchWriter::new(&db, ConnectionHandle::Pooled, 10)
            .write("q1", &table, &layout, &rows(1), |_, _| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueryExecutionError");
        assert!(err.to_string().contains("PRIMARY KEY"));
    }

    #[test]
    fn test_select_star_expansion() {
        let cols = [col("Name", 2, false), col("Id", 1, true), col("Total", 3, false)];
        assert_eq!(
            expand_select_star("SELECT * FROM src.Orders WHERE x = 1", &cols, false).unwrap(),
            Some("SELECT [Name], [Total] FROM src.Orders WHERE x = 1".to_string())
        );
        assert_eq!(
            expand_select_star("select top (10) * from t", &cols, true).unwrap(),
            Some("select top (10) [Id], [Name], [Total] from t".to_string())
        );
        assert_eq!(expand_select_star("SELECT a, b FROM t", &cols, false).unwrap(), None);
        assert_eq!(expand_select_star("SELECT COUNT(*) FROM t", &cols, false).unwrap(), None);
        assert_eq!(expand_select_star("SELECT * FROM t", &[], false).unwrap(), None);
    }

    #[tokio::test]
    async fn test_estimate_rows_uses_count_then_falls_back() {
        let db = FakeDatabase::new("source");
        db.on_rows("COUNT_BIG", &["row_count"], vec![vec![SqlValue::I64(42)]]);
        assert_eq!(estimate_rows(&db, "q1", "SELECT a FROM t;").await.unwrap(), 42);
        assert!(db.statements()[0].ends_with("FROM (SELECT a FROM t) AS src"));

        let db = FakeDatabase::new("source");
        db.on("COUNT_BIG", FakeResponse::Fail("Incorrect syntax near WITH".into()));
        db.on_rows("WITH", &["a"], vec![vec![SqlValue::I64(1)], vec![SqlValue::I64(2)]]);
        let sql = "WITH x AS (SELECT 1 AS a) SELECT a FROM x";
        assert_eq!(estimate_rows(&db, "q1", sql).await.unwrap(), 2);
    }
}
