//! SQL value types for rows moved between databases.
//!
//! Values are always owned: rows are fetched once per query, held for the
//! delete and insert steps, and then dropped.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL.
    Null,

    /// Boolean value (bit).
    Bool(bool),

    /// Integer value (tinyint through bigint).
    I64(i64),

    /// Floating point (real/float).
    F64(f64),

    /// Exact numeric (decimal/numeric/money).
    Decimal(Decimal),

    /// Character data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Whether this value renders as a quoted literal.
    #[must_use]
    pub fn is_quoted(&self) -> bool {
        matches!(
            self,
            SqlValue::Text(_)
                | SqlValue::Uuid(_)
                | SqlValue::DateTime(_)
                | SqlValue::DateTimeOffset(_)
                | SqlValue::Date(_)
                | SqlValue::Time(_)
        )
    }

    /// Render as a T-SQL literal.
    ///
    /// Strings are single-quoted with embedded quotes doubled; numbers inline
    /// verbatim; booleans become `1`/`0`; temporal values are quoted ISO text.
    #[must_use]
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F64(v) if v.is_finite() => v.to_string(),
            SqlValue::F64(_) => "NULL".to_string(),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Bytes(b) => format!("0x{}", hex::encode(b)),
            SqlValue::Uuid(u) => quote_literal(&u.to_string()),
            SqlValue::DateTime(dt) => quote_literal(&dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            SqlValue::DateTimeOffset(dt) => {
                quote_literal(&dt.format("%Y-%m-%d %H:%M:%S%.3f %:z").to_string())
            }
            SqlValue::Date(d) => quote_literal(&d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => quote_literal(&t.format("%H:%M:%S%.3f").to_string()),
        }
    }

    /// Plain text form without quoting, used for map keys and log output.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        match self {
            SqlValue::Text(s) => s.clone(),
            SqlValue::Null => "NULL".to_string(),
            other => {
                let literal = other.to_sql_literal();
                if other.is_quoted() {
                    literal[1..literal.len() - 1].replace("''", "'")
                } else {
                    literal
                }
            }
        }
    }

    /// Identity key for deduplication. Distinguishes `1` from `'1'`.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        let tag = match self {
            SqlValue::Null => 'n',
            SqlValue::Bool(_) => 'b',
            SqlValue::I64(_) | SqlValue::F64(_) | SqlValue::Decimal(_) => '#',
            SqlValue::Text(_) => 's',
            SqlValue::Bytes(_) => 'x',
            SqlValue::Uuid(_) => 'u',
            SqlValue::DateTime(_)
            | SqlValue::DateTimeOffset(_)
            | SqlValue::Date(_)
            | SqlValue::Time(_) => 't',
        };
        format!("{}:{}", tag, self.to_sql_literal())
    }

    /// Convert a plan-file value (YAML/JSON scalar) into a SqlValue.
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<Self> {
        match value {
            serde_yaml::Value::Null => Some(SqlValue::Null),
            serde_yaml::Value::Bool(b) => Some(SqlValue::Bool(*b)),
            serde_yaml::Value::Number(n) => n
                .as_i64()
                .map(SqlValue::I64)
                .or_else(|| n.as_f64().map(SqlValue::F64)),
            serde_yaml::Value::String(s) => Some(SqlValue::Text(s.clone())),
            serde_yaml::Value::Tagged(tagged) => Self::from_yaml(&tagged.value),
            serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => None,
        }
    }
}

/// Quote a string as a T-SQL literal, doubling embedded single quotes.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I64(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A fetched result set: column names plus rows in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    /// Get the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the row set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a column, matched exactly first and then case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }

    /// Value at (row, column name); `None` if the column does not exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}
