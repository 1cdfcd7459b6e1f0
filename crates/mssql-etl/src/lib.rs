//! # mssql-etl
//!
//! Configuration-driven SQL Server to SQL Server ETL library.
//!
//! A YAML plan lists source queries and target tables. A run supports:
//!
//! - **Variables** substituted into SQL as `${name}`, with static values,
//!   environment values and values extracted from databases at run time
//! - **Delete-before-insert** by primary key, in chunks under the parameter
//!   limit, optionally ordered by foreign key dependencies
//! - **Pre/post-processing scripts** split into statements and run in order
//! - **Batched multi-row inserts** with column overrides and identity insert
//! - **Resume capability** via HMAC-signed JSON progress snapshots
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_etl::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("plan.yaml")?;
//!     let summary = Orchestrator::new(config).run(None).await?;
//!     println!("Inserted {} rows", summary.total_processed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod db;
pub mod deletion;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod script;
pub mod transfer;
pub mod variables;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, MigrationPlan, QuerySpec, Settings};
pub use core::{RowSet, SqlValue, TableName};
pub use db::{Database, DatabaseSet, MssqlDatabase};
pub use error::{MigrateError, Result};
pub use orchestrator::{HealthStatus, Orchestrator, QueryResult, RunSummary, ValidationReport};
pub use progress::{ProgressSnapshot, ProgressTracker, QueryStatus, RunStatus};
pub use variables::{VariableStore, VariableValue};
