//! SQL Server implementation of [`Database`] over a bb8 pool of tiberius clients.

use super::{ColumnInfo, ConnectionHandle, Database, ForeignKeyRelation, ReferentialAction};
use crate::config::DatabaseConfig;
use crate::core::{RowSet, SqlValue, TableName};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

type TdsClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: DatabaseConfig,
}

impl TiberiusConnectionManager {
    fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = TdsClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// One SQL Server database: a connection pool plus an optional reserved
/// session connection.
pub struct MssqlDatabase {
    name: String,
    pool: Pool<TiberiusConnectionManager>,
    session: Mutex<Option<PooledConnection<'static, TiberiusConnectionManager>>>,
    in_transaction: AtomicBool,
}

impl MssqlDatabase {
    /// Open a pool and verify the database is reachable.
    pub async fn connect(name: &str, config: DatabaseConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| MigrateError::connection(name, e))?;

        let db = Self {
            name: name.to_string(),
            pool,
            session: Mutex::new(None),
            in_transaction: AtomicBool::new(false),
        };
        db.test_connection().await?;

        info!(
            "{}: connected to {}:{}/{} (pool_size={})",
            name, config.host, config.port, config.database, max_size
        );

        Ok(db)
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting {} connection", self.name)))
    }

    fn no_session(&self) -> MigrateError {
        MigrateError::pool(
            "no session connection reserved",
            format!("{}: statement requested the session handle", self.name),
        )
    }

    /// Run a statement on the session connection.
    async fn on_session(&self, sql: &str) -> Result<()> {
        let mut guard = self.session.lock().await;
        let conn = guard.as_mut().ok_or_else(|| self.no_session())?;
        conn.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

#[async_trait]
impl Database for MssqlDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(
        &self,
        handle: ConnectionHandle,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<RowSet> {
        match handle {
            ConnectionHandle::Pooled => {
                let mut conn = self.get_client().await?;
                fetch(&mut conn, sql, params).await
            }
            ConnectionHandle::Session => {
                let mut guard = self.session.lock().await;
                let conn = guard.as_mut().ok_or_else(|| self.no_session())?;
                fetch(conn, sql, params).await
            }
        }
    }

    async fn execute(
        &self,
        handle: ConnectionHandle,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        match handle {
            ConnectionHandle::Pooled => {
                let mut conn = self.get_client().await?;
                execute(&mut conn, sql, params).await
            }
            ConnectionHandle::Session => {
                let mut guard = self.session.lock().await;
                let conn = guard.as_mut().ok_or_else(|| self.no_session())?;
                execute(conn, sql, params).await
            }
        }
    }

    async fn begin_session(&self) -> Result<bool> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        let conn = self
            .pool
            .get_owned()
            .await
            .map_err(|e| MigrateError::pool(e, format!("reserving {} session", self.name)))?;
        *guard = Some(conn);
        debug!("{}: session reserved", self.name);
        Ok(true)
    }

    async fn end_session(&self) -> Result<()> {
        if self.in_transaction() {
            warn!("{}: ending session with an open transaction, rolling back", self.name);
            self.rollback().await?;
        }
        if self.session.lock().await.take().is_some() {
            debug!("{}: session released", self.name);
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.begin_session().await?;
        self.on_session("BEGIN TRANSACTION").await?;
        self.in_transaction.store(true, Ordering::SeqCst);
        info!("{}: transaction started", self.name);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.on_session("IF @@TRANCOUNT > 0 COMMIT TRANSACTION").await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        info!("{}: transaction committed", self.name);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.in_transaction.store(false, Ordering::SeqCst);
        self.on_session("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await?;
        warn!("{}: transaction rolled back", self.name);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    async fn table_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>> {
        let sql = r#"
            SELECT
                c.name,
                t.name,
                CAST(c.is_nullable AS INT),
                CAST(c.is_identity AS INT),
                CAST(c.column_id AS INT)
            FROM sys.columns c
            JOIN sys.types t ON c.user_type_id = t.user_type_id
            JOIN sys.tables tb ON c.object_id = tb.object_id
            JOIN sys.schemas s ON tb.schema_id = s.schema_id
            WHERE s.name = @P1 AND tb.name = @P2
            ORDER BY c.column_id
        "#;

        let mut conn = self.get_client().await?;
        let mut query = Query::new(sql);
        query.bind(table.schema_or_default().to_string());
        query.bind(table.name.clone());
        let rows = query.query(&mut *conn).await?.into_first_result().await?;

        let columns = rows
            .into_iter()
            .map(|row| ColumnInfo {
                name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
                data_type: row.get::<&str, _>(1).unwrap_or_default().to_string(),
                nullable: row.get::<i32, _>(2).unwrap_or(0) == 1,
                is_identity: row.get::<i32, _>(3).unwrap_or(0) == 1,
                ordinal: row.get::<i32, _>(4).unwrap_or(0),
            })
            .collect::<Vec<_>>();

        debug!("{}: loaded {} columns for {}", self.name, columns.len(), table);
        Ok(columns)
    }

    async fn foreign_keys(&self) -> Result<Vec<ForeignKeyRelation>> {
        let sql = r#"
            SELECT
                ps.name, pt.name, pc.name,
                rs.name, rt.name, rc.name,
                fk.delete_referential_action_desc
            FROM sys.foreign_keys fk
            JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id
            JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
            JOIN sys.schemas ps ON pt.schema_id = ps.schema_id
            JOIN sys.columns pc ON fkc.parent_object_id = pc.object_id AND fkc.parent_column_id = pc.column_id
            JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
            JOIN sys.schemas rs ON rt.schema_id = rs.schema_id
            JOIN sys.columns rc ON fkc.referenced_object_id = rc.object_id AND fkc.referenced_column_id = rc.column_id
            ORDER BY fk.name, fkc.constraint_column_id
        "#;

        let mut conn = self.get_client().await?;
        let rows = conn.simple_query(sql).await?.into_first_result().await?;

        let text = |row: &tiberius::Row, idx: usize| -> String {
            row.get::<&str, _>(idx).unwrap_or_default().to_string()
        };

        let relations = rows
            .iter()
            .map(|row| ForeignKeyRelation {
                parent_table: TableName {
                    schema: Some(text(row, 0)),
                    name: text(row, 1),
                },
                parent_column: text(row, 2),
                referenced_table: TableName {
                    schema: Some(text(row, 3)),
                    name: text(row, 4),
                },
                referenced_column: text(row, 5),
                on_delete: ReferentialAction::from_catalog(&text(row, 6)),
            })
            .collect::<Vec<_>>();

        debug!("{}: loaded {} foreign key columns", self.name, relations.len());
        Ok(relations)
    }

    async fn test_connection(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| MigrateError::connection(&self.name, e))?;
        conn.simple_query("SELECT 1")
            .await
            .map_err(|e| MigrateError::connection(&self.name, e))?
            .into_row()
            .await
            .map_err(|e| MigrateError::connection(&self.name, e))?;
        Ok(())
    }

    async fn close(&self) {
        self.session.lock().await.take();
        // bb8 closes idle connections when the pool is dropped
    }
}

fn build_query<'a>(sql: &'a str, params: &'a [SqlValue]) -> Query<'a> {
    let mut query = Query::new(sql);
    for value in params {
        match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::I64(v) => query.bind(*v),
            SqlValue::F64(v) => query.bind(*v),
            SqlValue::Decimal(v) => {
                query.bind(Numeric::new_with_scale(v.mantissa(), v.scale() as u8))
            }
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::DateTime(v) => query.bind(*v),
            SqlValue::DateTimeOffset(v) => query.bind(*v),
            SqlValue::Date(v) => query.bind(*v),
            SqlValue::Time(v) => query.bind(*v),
        }
    }
    query
}

async fn fetch(client: &mut TdsClient, sql: &str, params: &[SqlValue]) -> Result<RowSet> {
    let mut stream = build_query(sql, params).query(client).await?;
    let columns = stream
        .columns()
        .await?
        .map(|cols| cols.iter().map(|c| c.name().to_string()).collect::<Vec<_>>())
        .unwrap_or_default();

    let rows = stream
        .into_first_result()
        .await?
        .into_iter()
        .map(|row| row.into_iter().map(convert_column).collect::<Result<Vec<_>>>())
        .collect::<Result<Vec<_>>>()?;

    Ok(RowSet::new(columns, rows))
}

async fn execute(client: &mut TdsClient, sql: &str, params: &[SqlValue]) -> Result<u64> {
    let result = build_query(sql, params).execute(client).await?;
    Ok(result.rows_affected().iter().sum())
}

/// Convert one tiberius column into an owned value.
fn convert_column(data: ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::I64(v as i64)),
        ColumnData::I16(v) => v.map(|v| SqlValue::I64(v as i64)),
        ColumnData::I32(v) => v.map(|v| SqlValue::I64(v as i64)),
        ColumnData::I64(v) => v.map(SqlValue::I64),
        ColumnData::F32(v) => v.map(|v| SqlValue::F64(v as f64)),
        ColumnData::F64(v) => v.map(SqlValue::F64),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.map(|s| SqlValue::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Binary(v) => v.map(|b| SqlValue::Bytes(b.into_owned())),
        ColumnData::Xml(v) => v.map(|x| SqlValue::Text(x.into_owned().into_string())),
        ColumnData::Numeric(_) => Decimal::from_sql(&data)?.map(SqlValue::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)?.map(SqlValue::DateTime)
        }
        ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(&data)?.map(SqlValue::DateTimeOffset)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data)?.map(SqlValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)?.map(SqlValue::Time),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}
