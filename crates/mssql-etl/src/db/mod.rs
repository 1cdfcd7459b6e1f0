//! Database access: the [`Database`] trait, connection handles, catalog
//! metadata types and the per-run column cache.
//!
//! Every component talks to SQL Server through `Arc<dyn Database>`. The
//! production implementation is [`MssqlDatabase`] (bb8 pool of tiberius
//! clients); tests use an in-memory fake.

mod mssql;

#[cfg(test)]
pub mod fake;

pub use mssql::MssqlDatabase;

use crate::config::{Config, SOURCE, TARGET};
use crate::core::{RowSet, SqlValue, TableName};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Which physical connection a statement runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHandle {
    /// Any connection from the pool; nothing carries over between statements.
    Pooled,
    /// The connection reserved by [`Database::begin_session`]. Temp tables,
    /// `SET` options and open transactions persist across statements.
    Session,
}

/// Column metadata from the live catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_identity: bool,
    pub ordinal: i32,
}

/// ON DELETE behaviour of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
}

impl ReferentialAction {
    /// Parse `sys.foreign_keys.delete_referential_action_desc`.
    pub fn from_catalog(desc: &str) -> Self {
        match desc.to_uppercase().replace(' ', "_").as_str() {
            "CASCADE" => ReferentialAction::Cascade,
            "SET_NULL" => ReferentialAction::SetNull,
            "SET_DEFAULT" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }
}

/// One column pair of a foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRelation {
    /// Referencing (child) table.
    pub parent_table: TableName,
    pub parent_column: String,
    /// Referenced (parent-key) table.
    pub referenced_table: TableName,
    pub referenced_column: String,
    pub on_delete: ReferentialAction,
}

/// Async access to one SQL Server database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Logical name (`source`, `target` or a configured key).
    fn name(&self) -> &str;

    /// Run a statement and return its first result set.
    async fn query(&self, handle: ConnectionHandle, sql: &str, params: &[SqlValue])
        -> Result<RowSet>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&self, handle: ConnectionHandle, sql: &str, params: &[SqlValue])
        -> Result<u64>;

    /// Reserve one connection for [`ConnectionHandle::Session`] use.
    /// Returns `false` when a session is already held (it is reused).
    async fn begin_session(&self) -> Result<bool>;

    /// Release the reserved connection back to the pool.
    async fn end_session(&self) -> Result<()>;

    /// `BEGIN TRANSACTION` on the session, reserving one if needed.
    async fn begin_transaction(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Whether a transaction opened by [`Database::begin_transaction`] is open.
    fn in_transaction(&self) -> bool;

    /// Columns of a table in ordinal order. Empty when the table is unknown.
    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>>;

    /// Every foreign key relation in the database.
    async fn foreign_keys(&self) -> Result<Vec<ForeignKeyRelation>>;

    async fn test_connection(&self) -> Result<()>;

    async fn close(&self);
}

/// Handle to use for ordinary statements: the session while a transaction is
/// open, so that every write joins it, otherwise the pool.
pub fn default_handle(db: &dyn Database) -> ConnectionHandle {
    if db.in_transaction() {
        ConnectionHandle::Session
    } else {
        ConnectionHandle::Pooled
    }
}

/// All databases a run touches, by logical name.
#[derive(Clone)]
pub struct DatabaseSet {
    databases: IndexMap<String, Arc<dyn Database>>,
}

impl DatabaseSet {
    /// Open a pool per configured database and verify connectivity.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut databases: IndexMap<String, Arc<dyn Database>> = IndexMap::new();
        for name in config.database_names() {
            let Some(db_config) = config.database(&name) else {
                continue;
            };
            let db = MssqlDatabase::connect(
                &name,
                db_config.clone(),
                config.settings.max_connections,
            )
            .await?;
            databases.insert(name.to_lowercase(), Arc::new(db));
        }
        info!("Connected to {} database(s)", databases.len());
        Ok(Self { databases })
    }

    /// Build from already-open databases, keyed by [`Database::name`].
    pub fn from_databases(dbs: impl IntoIterator<Item = Arc<dyn Database>>) -> Self {
        let databases = dbs
            .into_iter()
            .map(|db| (db.name().to_lowercase(), db))
            .collect();
        Self { databases }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Database>> {
        self.databases
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| MigrateError::Config(format!("unknown database '{}'", name)))
    }

    pub fn source(&self) -> Result<Arc<dyn Database>> {
        self.get(SOURCE)
    }

    pub fn target(&self) -> Result<Arc<dyn Database>> {
        self.get(TARGET)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }

    pub async fn close_all(&self) {
        for (name, db) in &self.databases {
            if db.in_transaction() {
                warn!("{}: closing with an open transaction, rolling back", name);
                if let Err(e) = db.rollback().await {
                    warn!("{}: rollback on close failed: {}", name, e);
                }
            }
            db.close().await;
            debug!("{}: closed", name);
        }
    }
}

/// Per-run cache of table column metadata, keyed by (database, table).
#[derive(Default)]
pub struct MetadataCache {
    columns: Mutex<HashMap<(String, String), Vec<ColumnInfo>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of `table` in `db`, loaded from the catalog on first use.
    pub async fn columns(&self, db: &dyn Database, table: &TableName) -> Result<Vec<ColumnInfo>> {
        let key = (db.name().to_lowercase(), table.key());
        if let Some(cols) = self.lock().get(&key) {
            return Ok(cols.clone());
        }

        let cols = db.table_columns(table).await?;
        debug!("{}: cached {} columns for {}", db.name(), cols.len(), table);
        self.lock().insert(key, cols.clone());
        Ok(cols)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Vec<ColumnInfo>>> {
        self.columns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
