//! Configuration type definitions: connections, run settings and the migration plan.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database (where query data is read from).
    pub source: DatabaseConfig,

    /// Target database (where rows are deleted and inserted).
    pub target: DatabaseConfig,

    /// Additional named databases, addressable from dynamic variables and
    /// process groups by their key.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub databases: IndexMap<String, DatabaseConfig>,

    /// Run behaviour.
    #[serde(default)]
    pub settings: Settings,

    /// The migration plan itself.
    #[serde(flatten)]
    pub plan: MigrationPlan,
}

/// SQL Server connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Run behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Wrap every query of the run in one target transaction (default: false).
    /// The first failing query rolls back the whole run.
    #[serde(default)]
    pub use_transaction: bool,

    /// When target rows are deleted before re-insertion.
    #[serde(default)]
    pub delete_strategy: DeleteStrategy,

    /// Directory holding one progress snapshot per run.
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,

    /// Interval of the background snapshot save, in seconds (default: 30).
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,

    /// Rows per insert batch when a query does not set its own (default: 1000).
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Pool size per database (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Treat unresolved `${...}` placeholders in a query as a validation error.
    #[serde(default)]
    pub fail_on_unresolved: bool,

    /// Count source rows up front for progress/ETA (default: true).
    #[serde(default = "default_true")]
    pub estimate_rows: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_transaction: false,
            delete_strategy: DeleteStrategy::default(),
            progress_dir: default_progress_dir(),
            save_interval_secs: default_save_interval(),
            default_batch_size: default_batch_size(),
            max_connections: default_max_connections(),
            fail_on_unresolved: false,
            estimate_rows: true,
        }
    }
}

/// When `delete_before_insert` deletions happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStrategy {
    /// Delete each query's target rows right before inserting them.
    #[default]
    PerQuery,
    /// Delete all target rows up front, sequenced by foreign keys.
    Ordered,
}

/// Declarative migration plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Optional plan name, used in log output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Static variables. Scalars, lists (rendered as IN-lists) and maps.
    #[serde(default)]
    pub variables: IndexMap<String, serde_yaml::Value>,

    /// Variables computed at run time from a query.
    #[serde(default)]
    pub dynamic_variables: Vec<DynamicVariableSpec>,

    /// Global pre-processing groups, run before variable extraction.
    #[serde(default)]
    pub pre_process: Vec<ProcessGroup>,

    /// Global post-processing groups, run after every query.
    #[serde(default)]
    pub post_process: Vec<ProcessGroup>,

    /// Global column overrides: column name → SQL expression.
    #[serde(default)]
    pub column_overrides: IndexMap<String, String>,

    /// Queries, executed in declaration order.
    #[serde(default)]
    pub queries: Vec<QuerySpec>,
}

impl MigrationPlan {
    /// Enabled queries in declaration order.
    pub fn enabled_queries(&self) -> impl Iterator<Item = &QuerySpec> {
        self.queries.iter().filter(|q| q.enabled)
    }

    pub fn query(&self, id: &str) -> Option<&QuerySpec> {
        self.queries.iter().find(|q| q.id == id)
    }
}

/// One copy step: source query → target table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpec {
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Inline source SQL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_query: Option<String>,

    /// External file holding the source SQL (resolved at load).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,

    /// Database the source query runs against (default: "source").
    #[serde(default = "default_source")]
    pub source_database: String,

    pub target_table: String,

    /// Target columns; derived from the fetched rows when empty.
    #[serde(default)]
    pub target_columns: Vec<String>,

    /// Primary key column(s) used for delete-before-insert.
    #[serde(default, deserialize_with = "one_or_many")]
    pub identity_columns: Vec<String>,

    /// Rows per insert batch (default: settings.default_batch_size).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default)]
    pub delete_before_insert: bool,

    /// Insert explicit values into an IDENTITY column.
    #[serde(default)]
    pub identity_insert: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_process: Option<ProcessGroup>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<ProcessGroup>,

    /// Which global column overrides apply (default: all).
    #[serde(default)]
    pub column_overrides: OverridePolicy,
}

impl QuerySpec {
    /// Source SQL text (after file resolution).
    pub fn source_text(&self) -> &str {
        self.source_query.as_deref().unwrap_or_default()
    }
}

/// Selection of global column overrides applied to one query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawOverridePolicy", into = "RawOverridePolicy")]
pub enum OverridePolicy {
    #[default]
    All,
    None,
    Only(Vec<String>),
}

impl OverridePolicy {
    /// Whether the override for `column` applies (names compare case-insensitively).
    pub fn includes(&self, column: &str) -> bool {
        match self {
            OverridePolicy::All => true,
            OverridePolicy::None => false,
            OverridePolicy::Only(names) => names.iter().any(|n| n.eq_ignore_ascii_case(column)),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawOverridePolicy {
    Keyword(String),
    List(Vec<String>),
}

impl TryFrom<RawOverridePolicy> for OverridePolicy {
    type Error = String;

    fn try_from(raw: RawOverridePolicy) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawOverridePolicy::Keyword(k) => match k.to_lowercase().as_str() {
                "all" => Ok(OverridePolicy::All),
                "none" => Ok(OverridePolicy::None),
                other => Err(format!(
                    "column_overrides must be 'all', 'none' or a list of column names, got '{}'",
                    other
                )),
            },
            RawOverridePolicy::List(names) => Ok(OverridePolicy::Only(names)),
        }
    }
}

impl From<OverridePolicy> for RawOverridePolicy {
    fn from(policy: OverridePolicy) -> Self {
        match policy {
            OverridePolicy::All => RawOverridePolicy::Keyword("all".into()),
            OverridePolicy::None => RawOverridePolicy::Keyword("none".into()),
            OverridePolicy::Only(names) => RawOverridePolicy::List(names),
        }
    }
}

/// A named block of pre/post SQL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Inline script, possibly several statements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// External script file (resolved at load).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<PathBuf>,

    /// Database to run against (default: target).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Run every statement on one reserved connection (temp tables).
    #[serde(default)]
    pub session: bool,
}

impl ProcessGroup {
    pub fn script_text(&self) -> &str {
        self.script.as_deref().unwrap_or_default()
    }

    pub fn database_name(&self) -> &str {
        self.database.as_deref().unwrap_or(TARGET)
    }
}

/// Variable computed from a query at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicVariableSpec {
    pub id: String,

    /// Variable name used in `${name}` placeholders.
    #[serde(alias = "variable_name")]
    pub name: String,

    /// Database the query runs against (default: source).
    #[serde(default = "default_source")]
    pub database: String,

    pub query: String,

    /// Reduction strategy; absent means column_identified over all columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_type: Option<ExtractionType>,

    /// Column for single_column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    /// Columns for multiple_columns and column_identified.
    #[serde(default)]
    pub columns: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// How a dynamic variable's result set is reduced to a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    SingleValue,
    SingleColumn,
    MultipleColumns,
    ColumnIdentified,
    KeyValuePairs,
    /// Any unrecognised name; treated as column_identified.
    #[serde(other)]
    Unknown,
}

/// Logical name of the source database.
pub const SOURCE: &str = "source";
/// Logical name of the target database.
pub const TARGET: &str = "target";

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        OneOrMany::Many(v) => v,
    })
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_true() -> bool {
    true
}

fn default_source() -> String {
    SOURCE.to_string()
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("migration-progress")
}

fn default_save_interval() -> u64 {
    30
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_connections() -> u32 {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_policy_forms() {
        let p: OverridePolicy = serde_yaml::from_str("all").unwrap();
        assert_eq!(p, OverridePolicy::All);
        let p: OverridePolicy = serde_yaml::from_str("NONE").unwrap();
        assert_eq!(p, OverridePolicy::None);
        let p: OverridePolicy = serde_yaml::from_str("[UpdatedAt, UpdatedBy]").unwrap();
        assert!(p.includes("updatedat"));
        assert!(!p.includes("CreatedAt"));
        assert!(serde_yaml::from_str::<OverridePolicy>("some").is_err());
    }

    #[test]
    fn test_identity_columns_accept_string_or_list() {
        let q: QuerySpec = serde_yaml::from_str(
            "id: q1\nsource_query: SELECT 1\ntarget_table: t\nidentity_columns: OrderId, LineNo\n",
        )
        .unwrap();
        assert_eq!(q.identity_columns, vec!["OrderId", "LineNo"]);

        let q: QuerySpec = serde_yaml::from_str(
            "id: q1\nsource_query: SELECT 1\ntarget_table: t\nidentity_columns: [Id]\n",
        )
        .unwrap();
        assert_eq!(q.identity_columns, vec!["Id"]);
        assert!(q.enabled);
        assert_eq!(q.source_database, SOURCE);
    }

    #[test]
    fn test_unknown_extraction_type() {
        let t: ExtractionType = serde_yaml::from_str("something_else").unwrap();
        assert_eq!(t, ExtractionType::Unknown);
        let t: ExtractionType = serde_yaml::from_str("key_value_pairs").unwrap();
        assert_eq!(t, ExtractionType::KeyValuePairs);
    }

    #[test]
    fn test_settings_defaults() {
        let s = Settings::default();
        assert!(!s.use_transaction);
        assert_eq!(s.delete_strategy, DeleteStrategy::PerQuery);
        assert_eq!(s.default_batch_size, 1000);
        assert_eq!(s.save_interval_secs, 30);
    }

    #[test]
    fn test_database_config_debug_redacts_password() {
        let cfg = DatabaseConfig {
            host: "localhost".into(),
            port: 1433,
            database: "db".into(),
            user: "sa".into(),
            password: "super_secret_password_123".into(),
            encrypt: "true".into(),
            trust_server_cert: false,
        };
        let debug_output = format!("{:?}", cfg);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
