//! Dynamic variable extraction: run a query and reduce its rows to a value.

use super::{VariableStore, VariableValue};
use crate::config::{DynamicVariableSpec, ExtractionType};
use crate::core::{RowSet, SqlValue};
use crate::db::{ConnectionHandle, DatabaseSet};
use crate::error::{MigrateError, Result};
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Runs dynamic variable queries against the run's databases.
pub struct DynamicExtractor<'a> {
    databases: &'a DatabaseSet,
}

impl<'a> DynamicExtractor<'a> {
    pub fn new(databases: &'a DatabaseSet) -> Self {
        Self { databases }
    }

    /// Extract every enabled variable in declaration order, storing each one
    /// before the next query is substituted. Returns how many were stored.
    pub async fn extract_all(
        &self,
        specs: &[DynamicVariableSpec],
        store: &mut VariableStore,
    ) -> Result<usize> {
        let mut stored = 0;
        for spec in specs.iter().filter(|s| s.enabled) {
            let value = self.extract(spec, store).await?;
            info!(
                "Variable {} = {} value(s) from {}",
                spec.name,
                value.len(),
                spec.database
            );
            if store.set_dynamic(&spec.name, value) {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Extract one variable. Its query sees every variable stored so far.
    pub async fn extract(
        &self,
        spec: &DynamicVariableSpec,
        store: &VariableStore,
    ) -> Result<VariableValue> {
        let substituted = store.substitute(&spec.query);
        if !substituted.is_complete() {
            return Err(MigrateError::extraction(
                &spec.name,
                format!(
                    "unresolved placeholders in query: {}",
                    substituted.unresolved.join(", ")
                ),
            ));
        }

        let db = self
            .databases
            .get(&spec.database)
            .map_err(|e| MigrateError::extraction(&spec.name, e))?;
        debug!("Extracting {} from {}: {}", spec.name, spec.database, substituted.sql);

        let rows = db
            .query(ConnectionHandle::Pooled, &substituted.sql, &[])
            .await
            .map_err(|e| MigrateError::extraction(&spec.name, e))?;

        reduce(spec, &rows)
    }
}

/// Reduce a result set according to the variable's extraction type.
pub fn reduce(spec: &DynamicVariableSpec, rows: &RowSet) -> Result<VariableValue> {
    let kind = match spec.extraction_type {
        None => ExtractionType::ColumnIdentified,
        Some(ExtractionType::Unknown) => {
            warn!(
                "Variable {}: unknown extraction type, using column_identified",
                spec.name
            );
            ExtractionType::ColumnIdentified
        }
        Some(kind) => kind,
    };

    if rows.is_empty() {
        debug!("Variable {}: query returned no rows", spec.name);
        return Ok(match kind {
            ExtractionType::ColumnIdentified | ExtractionType::KeyValuePairs => {
                VariableValue::Map(IndexMap::new())
            }
            _ => VariableValue::Array(Vec::new()),
        });
    }

    match kind {
        ExtractionType::SingleValue => {
            let idx = match spec.column {
                Some(ref c) => resolve_column(spec, rows, c)?,
                None => 0,
            };
            let value = rows.rows[0].get(idx).cloned().unwrap_or(SqlValue::Null);
            Ok(VariableValue::Scalar(value))
        }
        ExtractionType::SingleColumn => {
            let idx = match spec.column {
                Some(ref c) => resolve_column(spec, rows, c)?,
                None => 0,
            };
            let values = column_values(rows, idx)
                .into_iter()
                .filter(|v| !v.is_null())
                .collect();
            Ok(VariableValue::Array(values))
        }
        ExtractionType::MultipleColumns => {
            let indexes = selected_columns(spec, rows)?;
            let values = rows
                .rows
                .iter()
                .flat_map(|row| {
                    indexes
                        .iter()
                        .map(move |&i| row.get(i).cloned().unwrap_or(SqlValue::Null))
                })
                .collect();
            Ok(VariableValue::Array(values))
        }
        ExtractionType::ColumnIdentified | ExtractionType::Unknown => {
            let indexes = selected_columns(spec, rows)?;
            let map = indexes
                .into_iter()
                .map(|i| {
                    let mut seen = HashSet::new();
                    let values = column_values(rows, i)
                        .into_iter()
                        .filter(|v| seen.insert(v.dedup_key()))
                        .collect();
                    (rows.columns[i].clone(), VariableValue::Array(values))
                })
                .collect();
            Ok(VariableValue::Map(map))
        }
        ExtractionType::KeyValuePairs => {
            let (key_idx, value_idx) = match spec.columns.as_slice() {
                [k, v, ..] => (resolve_column(spec, rows, k)?, resolve_column(spec, rows, v)?),
                _ if rows.columns.len() >= 2 => (0, 1),
                _ => {
                    return Err(MigrateError::extraction(
                        &spec.name,
                        "key_value_pairs needs at least two columns",
                    ))
                }
            };
            let mut map = IndexMap::new();
            for row in &rows.rows {
                let key = row.get(key_idx).map(SqlValue::to_plain_string).unwrap_or_default();
                let value = row.get(value_idx).cloned().unwrap_or(SqlValue::Null);
                // later rows overwrite earlier ones
                map.insert(key, VariableValue::Scalar(value));
            }
            Ok(VariableValue::Map(map))
        }
    }
}

fn resolve_column(spec: &DynamicVariableSpec, rows: &RowSet, name: &str) -> Result<usize> {
    rows.column_index(name).ok_or_else(|| {
        MigrateError::extraction(
            &spec.name,
            format!(
                "column '{}' not in result (columns: {})",
                name,
                rows.columns.join(", ")
            ),
        )
    })
}

/// Named columns, or every result column when none are named.
fn selected_columns(spec: &DynamicVariableSpec, rows: &RowSet) -> Result<Vec<usize>> {
    if spec.columns.is_empty() {
        return Ok((0..rows.columns.len()).collect());
    }
    spec.columns
        .iter()
        .map(|c| resolve_column(spec, rows, c))
        .collect()
}

fn column_values(rows: &RowSet, idx: usize) -> Vec<SqlValue> {
    rows.rows
        .iter()
        .map(|r| r.get(idx).cloned().unwrap_or(SqlValue::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::{FakeDatabase, FakeResponse};
    use crate::db::Database;
    use std::sync::Arc;

    fn spec(kind: Option<ExtractionType>, columns: &[&str]) -> DynamicVariableSpec {
        DynamicVariableSpec {
            id: "v1".into(),
            name: "var".into(),
            database: "source".into(),
            query: "SELECT 1".into(),
            extraction_type: kind,
            column: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            enabled: true,
        }
    }

    fn two_col_rows() -> RowSet {
        RowSet::new(
            vec!["c1".into(), "c2".into()],
            vec![
                vec![SqlValue::I64(1), SqlValue::Text("a".into())],
                vec![SqlValue::I64(1), SqlValue::Text("b".into())],
                vec![SqlValue::I64(2), SqlValue::Text("a".into())],
            ],
        )
    }

    #[test]
    fn test_single_value() {
        let v = reduce(&spec(Some(ExtractionType::SingleValue), &[]), &two_col_rows()).unwrap();
        assert_eq!(v, VariableValue::Scalar(SqlValue::I64(1)));
    }

    #[test]
    fn test_single_column_by_name() {
        let mut s = spec(Some(ExtractionType::SingleColumn), &[]);
        s.column = Some("C2".into());
        let v = reduce(&s, &two_col_rows()).unwrap();
        assert_eq!(v.render(), "'a', 'b', 'a'");
    }

    #[test]
    fn test_single_column_skips_nulls() {
        let rows = RowSet::new(
            vec!["id".into()],
            vec![
                vec![SqlValue::I64(1)],
                vec![SqlValue::Null],
                vec![SqlValue::I64(2)],
            ],
        );
        let v = reduce(&spec(Some(ExtractionType::SingleColumn), &[]), &rows).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v.render(), "1, 2");
    }

    #[test]
    fn test_multiple_columns_keeps_duplicates() {
        let v = reduce(&spec(Some(ExtractionType::MultipleColumns), &["c1"]), &two_col_rows())
            .unwrap();
        assert_eq!(v.len(), 3);
        assert_eq!(v.render(), "1, 1, 2");
    }

    #[test]
    fn test_column_identified_dedupes_per_column() {
        let v = reduce(&spec(None, &["c1", "c2"]), &two_col_rows()).unwrap();
        let mut store = VariableStore::new();
        store.set_dynamic("var", v);

        assert_eq!(store.substitute("${var.c1}").sql, "1, 2");
        assert_eq!(store.substitute("${var.c2}").sql, "'a', 'b'");
        assert_eq!(store.substitute("${var}").sql, "1, 2, 'a', 'b'");
    }

    #[test]
    fn test_key_value_pairs_last_write_wins() {
        let rows = RowSet::new(
            vec!["k".into(), "v".into()],
            vec![
                vec![SqlValue::Text("x".into()), SqlValue::I64(1)],
                vec![SqlValue::Text("y".into()), SqlValue::I64(2)],
                vec![SqlValue::Text("x".into()), SqlValue::I64(3)],
            ],
        );
        let v = reduce(&spec(Some(ExtractionType::KeyValuePairs), &[]), &rows).unwrap();
        assert_eq!(v.get("x"), Some(&VariableValue::Scalar(SqlValue::I64(3))));
        assert_eq!(v.get("y"), Some(&VariableValue::Scalar(SqlValue::I64(2))));
    }

    #[test]
    fn test_key_value_pairs_needs_two_columns() {
        let rows = RowSet::new(vec!["k".into()], vec![vec![SqlValue::I64(1)]]);
        let err = reduce(&spec(Some(ExtractionType::KeyValuePairs), &[]), &rows).unwrap_err();
        assert_eq!(err.kind(), "ExtractionError");
    }

    #[test]
    fn test_missing_column_is_error() {
        let err = reduce(&spec(None, &["nope"]), &two_col_rows()).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_empty_result() {
        let empty = RowSet::default();
        let v = reduce(&spec(Some(ExtractionType::SingleColumn), &[]), &empty).unwrap();
        assert_eq!(v.render(), "NULL");
        let v = reduce(&spec(None, &["c1"]), &empty).unwrap();
        assert_eq!(v, VariableValue::Map(IndexMap::new()));
    }

    #[test]
    fn test_unknown_type_falls_back_to_column_identified() {
        let v = reduce(&spec(Some(ExtractionType::Unknown), &[]), &two_col_rows()).unwrap();
        assert!(matches!(v, VariableValue::Map(_)));
    }

    #[tokio::test]
    async fn test_extract_all_chains_variables() {
        let source = Arc::new(FakeDatabase::new("source"));
        source.on_rows(
            "from dbo.regions",
            &["RegionId"],
            vec![vec![SqlValue::I64(7)], vec![SqlValue::I64(9)]],
        );
        source.on_rows(
            "from dbo.stores where regionid in (7, 9)",
            &["StoreId"],
            vec![vec![SqlValue::I64(70)]],
        );
        let set = DatabaseSet::from_databases([source.clone() as Arc<dyn Database>]);

        let mut first = spec(Some(ExtractionType::SingleColumn), &[]);
        first.name = "regions".into();
        first.query = "SELECT RegionId FROM dbo.Regions".into();
        let mut second = spec(Some(ExtractionType::SingleColumn), &[]);
        second.id = "v2".into();
        second.name = "stores".into();
        second.query = "SELECT StoreId FROM dbo.Stores WHERE RegionId IN (${regions})".into();

        let mut store = VariableStore::new();
        let n = DynamicExtractor::new(&set)
            .extract_all(&[first, second], &mut store)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.substitute("${stores}").sql, "70");
    }

    #[tokio::test]
    async fn test_query_failure_is_extraction_error() {
        let source = Arc::new(FakeDatabase::new("source"));
        source.on("select", FakeResponse::Fail("invalid object name".into()));
        let set = DatabaseSet::from_databases([source as Arc<dyn Database>]);
        let store = VariableStore::new();
        let err = DynamicExtractor::new(&set)
            .extract(&spec(None, &[]), &store)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ExtractionError");
    }
}
