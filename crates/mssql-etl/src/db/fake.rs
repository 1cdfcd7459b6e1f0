//! In-memory [`Database`] for unit tests.
//!
//! Statements are matched against scripted rules (case-insensitive substring,
//! first match wins) and recorded in order for assertions.

use super::{ColumnInfo, ConnectionHandle, Database, ForeignKeyRelation, ReferentialAction};
use crate::core::{RowSet, SqlValue, TableName};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum FakeResponse {
    Rows(RowSet),
    Affected(u64),
    Fail(String),
}

struct Rule {
    pattern: String,
    response: FakeResponse,
    remaining: Option<usize>,
}

/// One statement the fake received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub handle: ConnectionHandle,
}

pub struct FakeDatabase {
    name: String,
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<Recorded>>,
    columns: Mutex<HashMap<String, Vec<ColumnInfo>>>,
    foreign_keys: Mutex<Vec<ForeignKeyRelation>>,
    lookups: AtomicUsize,
    session: AtomicBool,
    transaction: AtomicBool,
    unreachable: AtomicBool,
    catalog_down: AtomicBool,
}

impl FakeDatabase {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            columns: Mutex::new(HashMap::new()),
            foreign_keys: Mutex::new(Vec::new()),
            lookups: AtomicUsize::new(0),
            session: AtomicBool::new(false),
            transaction: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            catalog_down: AtomicBool::new(false),
        }
    }

    /// Answer every statement containing `pattern`.
    pub fn on(&self, pattern: &str, response: FakeResponse) -> &Self {
        self.push_rule(pattern, response, None)
    }

    /// Answer the next `times` statements containing `pattern`.
    pub fn on_times(&self, pattern: &str, response: FakeResponse, times: usize) -> &Self {
        self.push_rule(pattern, response, Some(times))
    }

    pub fn on_rows(&self, pattern: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> &Self {
        let rs = RowSet::new(columns.iter().map(|c| c.to_string()).collect(), rows);
        self.on(pattern, FakeResponse::Rows(rs))
    }

    /// Register a table's columns; `identity` names the IDENTITY column.
    pub fn set_columns(&self, table: &str, names: &[&str], identity: Option<&str>) {
        let key = TableName::parse(table).map(|t| t.key()).unwrap_or_default();
        let cols = names
            .iter()
            .enumerate()
            .map(|(i, n)| ColumnInfo {
                name: n.to_string(),
                data_type: "int".to_string(),
                nullable: true,
                is_identity: identity.is_some_and(|id| id.eq_ignore_ascii_case(n)),
                ordinal: i as i32 + 1,
            })
            .collect();
        lock(&self.columns).insert(key, cols);
    }

    pub fn add_foreign_key(&self, parent: &str, referenced: &str, on_delete: ReferentialAction) {
        let parse = |t: &str| {
            TableName::parse(t).unwrap_or(TableName {
                schema: None,
                name: t.to_string(),
            })
        };
        lock(&self.foreign_keys).push(ForeignKeyRelation {
            parent_table: parse(parent),
            parent_column: "ref_id".to_string(),
            referenced_table: parse(referenced),
            referenced_column: "id".to_string(),
            on_delete,
        });
    }

    /// Make `test_connection` fail.
    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    /// Make `foreign_keys` fail.
    pub fn fail_foreign_keys(&self) {
        self.catalog_down.store(true, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        lock(&self.log).clone()
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.log).iter().map(|r| r.sql.clone()).collect()
    }

    /// Statements containing `pattern` (case-insensitive).
    pub fn statements_matching(&self, pattern: &str) -> Vec<Recorded> {
        let pattern = pattern.to_lowercase();
        lock(&self.log)
            .iter()
            .filter(|r| r.sql.to_lowercase().contains(&pattern))
            .cloned()
            .collect()
    }

    pub fn catalog_lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn has_session(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    fn push_rule(&self, pattern: &str, response: FakeResponse, remaining: Option<usize>) -> &Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_lowercase(),
            response,
            remaining,
        });
        self
    }

    fn respond(&self, handle: ConnectionHandle, sql: &str, params: &[SqlValue]) -> Result<Option<FakeResponse>> {
        if handle == ConnectionHandle::Session && !self.has_session() {
            return Err(MigrateError::pool("no session connection reserved", &self.name));
        }
        lock(&self.log).push(Recorded {
            sql: sql.to_string(),
            params: params.to_vec(),
            handle,
        });

        let lower = sql.to_lowercase();
        let mut rules = lock(&self.rules);
        let Some(rule) = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && lower.contains(&r.pattern))
        else {
            return Ok(None);
        };
        if let Some(ref mut n) = rule.remaining {
            *n -= 1;
        }
        match rule.response {
            FakeResponse::Fail(ref msg) => Err(MigrateError::Database(
                tiberius::error::Error::Protocol(msg.clone().into()),
            )),
            ref other => Ok(Some(other.clone())),
        }
    }

    fn record_event(&self, sql: &str) {
        lock(&self.log).push(Recorded {
            sql: sql.to_string(),
            params: Vec::new(),
            handle: ConnectionHandle::Session,
        });
    }
}

#[async_trait]
impl Database for FakeDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, handle: ConnectionHandle, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
        match self.respond(handle, sql, params)? {
            Some(FakeResponse::Rows(rs)) => Ok(rs),
            _ => Ok(RowSet::default()),
        }
    }

    async fn execute(&self, handle: ConnectionHandle, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self.respond(handle, sql, params)? {
            Some(FakeResponse::Affected(n)) => Ok(n),
            Some(FakeResponse::Rows(rs)) => Ok(rs.len() as u64),
            _ => Ok(0),
        }
    }

    async fn begin_session(&self) -> Result<bool> {
        Ok(!self.session.swap(true, Ordering::SeqCst))
    }

    async fn end_session(&self) -> Result<()> {
        if self.transaction.load(Ordering::SeqCst) {
            self.rollback().await?;
        }
        self.session.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.begin_session().await?;
        self.transaction.store(true, Ordering::SeqCst);
        self.record_event("BEGIN TRANSACTION");
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.transaction.store(false, Ordering::SeqCst);
        self.record_event("COMMIT");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.transaction.store(false, Ordering::SeqCst);
        self.record_event("ROLLBACK");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.load(Ordering::SeqCst)
    }

    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.columns).get(&table.key()).cloned().unwrap_or_default())
    }

    async fn foreign_keys(&self) -> Result<Vec<ForeignKeyRelation>> {
        if self.catalog_down.load(Ordering::SeqCst) {
            return Err(MigrateError::query("foreign_keys", "catalog view unavailable"));
        }
        Ok(lock(&self.foreign_keys).clone())
    }

    async fn test_connection(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MigrateError::connection(&self.name, "connection refused"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.session.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
