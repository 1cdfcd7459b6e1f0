//! Variables and `${...}` substitution into SQL text.
//!
//! Each placeholder of the template is resolved against four sources, the
//! first match winning:
//!
//! 1. dynamic variables (extracted from queries at run time)
//! 2. static variables from the plan
//! 3. built-in timestamp functions, evaluated at substitution time
//! 4. process environment variables, inserted verbatim
//!
//! Substituted text is never scanned again, so a value containing `${...}`
//! lands in the SQL as written.
//!
//! Array values render as IN-list fragments: `${ids}` with `[1, 2]` becomes
//! `1, 2`, and an empty array becomes `NULL` so `IN (${ids})` stays valid SQL.
//! Map values address one key with `${name.key}`; bare `${name}` flattens the
//! map into one IN-list.

mod extract;

pub use extract::DynamicExtractor;

use crate::core::SqlValue;
use chrono::{DateTime, Local, Utc};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([^{}.\s]+)(?:\.([^{}]+?))?\s*\}").expect("placeholder pattern")
});

/// Value of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Scalar(SqlValue),
    Array(Vec<SqlValue>),
    Map(IndexMap<String, VariableValue>),
}

impl VariableValue {
    /// Convert a plan-file value. Sequences become arrays, mappings become maps.
    pub fn from_yaml(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Sequence(items) => VariableValue::Array(
                items
                    .iter()
                    .map(|v| SqlValue::from_yaml(v).unwrap_or_else(|| yaml_as_text(v)))
                    .collect(),
            ),
            serde_yaml::Value::Mapping(map) => VariableValue::Map(
                map.iter()
                    .map(|(k, v)| (yaml_key(k), VariableValue::from_yaml(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => VariableValue::from_yaml(&tagged.value),
            scalar => VariableValue::Scalar(SqlValue::from_yaml(scalar).unwrap_or(SqlValue::Null)),
        }
    }

    /// SQL fragment for this value.
    pub fn render(&self) -> String {
        match self {
            VariableValue::Scalar(v) => v.to_sql_literal(),
            VariableValue::Array(items) => render_list(items.iter()),
            VariableValue::Map(map) => render_list(flatten_map(map).into_iter()),
        }
    }

    /// Entry of a map value; keys compare case-insensitively.
    pub fn get(&self, key: &str) -> Option<&VariableValue> {
        match self {
            VariableValue::Map(map) => map.get(key).or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            }),
            _ => None,
        }
    }

    /// Number of values this renders (1 for scalars).
    pub fn len(&self) -> usize {
        match self {
            VariableValue::Scalar(_) => 1,
            VariableValue::Array(items) => items.len(),
            VariableValue::Map(map) => flatten_map(map).len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn render_list<'a>(items: impl Iterator<Item = &'a SqlValue>) -> String {
    let parts: Vec<String> = items.map(SqlValue::to_sql_literal).collect();
    if parts.is_empty() {
        "NULL".to_string()
    } else {
        parts.join(", ")
    }
}

/// Array-valued entries if any exist, otherwise every scalar entry.
fn flatten_map(map: &IndexMap<String, VariableValue>) -> Vec<&SqlValue> {
    let has_arrays = map.values().any(|v| matches!(v, VariableValue::Array(_)));
    map.values()
        .flat_map(|v| match v {
            VariableValue::Array(items) if has_arrays => items.iter().collect::<Vec<_>>(),
            VariableValue::Scalar(s) if !has_arrays => vec![s],
            _ => Vec::new(),
        })
        .collect()
}

fn yaml_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        other => SqlValue::from_yaml(other)
            .map(|v| v.to_plain_string())
            .unwrap_or_default(),
    }
}

fn yaml_as_text(value: &serde_yaml::Value) -> SqlValue {
    SqlValue::Text(serde_yaml::to_string(value).unwrap_or_default().trim().to_string())
}

/// Where a variable came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSource {
    Dynamic,
    Static,
}

/// Result of substituting placeholders into one SQL text.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub sql: String,
    /// Placeholders (without `${}`) that no pass could resolve, in order of appearance.
    pub unresolved: Vec<String>,
}

impl Substitution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Static and dynamic variables of one run.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    static_vars: IndexMap<String, VariableValue>,
    dynamic_vars: IndexMap<String, VariableValue>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the plan's static variables.
    pub fn from_plan(vars: &IndexMap<String, serde_yaml::Value>) -> Self {
        let mut store = Self::new();
        for (name, value) in vars {
            store.set_static(name, VariableValue::from_yaml(value));
        }
        store
    }

    /// Define a static variable. Names are write-once; a redefinition is ignored.
    pub fn set_static(&mut self, name: &str, value: VariableValue) -> bool {
        insert_once(&mut self.static_vars, name, value, VariableSource::Static)
    }

    /// Define a dynamic variable. Names are write-once; a redefinition is ignored.
    pub fn set_dynamic(&mut self, name: &str, value: VariableValue) -> bool {
        insert_once(&mut self.dynamic_vars, name, value, VariableSource::Dynamic)
    }

    /// Drop every dynamic variable so a resumed run re-extracts them.
    pub fn clear_dynamic(&mut self) {
        self.dynamic_vars.clear();
    }

    /// Look up a variable, dynamic first.
    pub fn get(&self, name: &str) -> Option<(&VariableValue, VariableSource)> {
        self.dynamic_vars
            .get(name)
            .map(|v| (v, VariableSource::Dynamic))
            .or_else(|| self.static_vars.get(name).map(|v| (v, VariableSource::Static)))
    }

    pub fn dynamic_names(&self) -> impl Iterator<Item = &str> {
        self.dynamic_vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.static_vars.len() + self.dynamic_vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Substitute every placeholder in `sql`, timestamps taken from the clock.
    pub fn substitute(&self, sql: &str) -> Substitution {
        self.substitute_at(sql, Local::now())
    }

    /// Substitute with a fixed "now" for the built-in timestamp functions.
    pub fn substitute_at(&self, sql: &str, now: DateTime<Local>) -> Substitution {
        let mut seen = HashSet::new();
        let mut unresolved = Vec::new();
        let text = PLACEHOLDER
            .replace_all(sql, |caps: &Captures| {
                let name = &caps[1];
                let key = caps.get(2).map(|m| m.as_str().trim());
                if let Some(value) = self.resolve(name, key, now) {
                    return value;
                }
                let whole = &caps[0];
                let placeholder = whole[2..whole.len() - 1].trim().to_string();
                if seen.insert(placeholder.clone()) {
                    unresolved.push(placeholder);
                }
                whole.to_string()
            })
            .into_owned();

        if !unresolved.is_empty() {
            debug!("Unresolved placeholders: {}", unresolved.join(", "));
        }

        Substitution {
            sql: text,
            unresolved,
        }
    }

    fn resolve(&self, name: &str, key: Option<&str>, now: DateTime<Local>) -> Option<String> {
        if let Some(value) = self.dynamic_vars.get(name).and_then(|v| lookup_rendered(v, key)) {
            return Some(value);
        }
        if let Some(value) = self.static_vars.get(name).and_then(|v| lookup_rendered(v, key)) {
            return Some(value);
        }
        if key.is_some() {
            return None;
        }
        builtin(name, now).or_else(|| std::env::var(name).ok())
    }
}

fn insert_once(
    vars: &mut IndexMap<String, VariableValue>,
    name: &str,
    value: VariableValue,
    source: VariableSource,
) -> bool {
    if vars.contains_key(name) {
        warn!(
            "{:?} variable '{}' is already defined; keeping the first value",
            source, name
        );
        return false;
    }
    vars.insert(name.to_string(), value);
    true
}

fn lookup_rendered(value: &VariableValue, key: Option<&str>) -> Option<String> {
    match key {
        None => Some(value.render()),
        Some(k) => value.get(k).map(VariableValue::render),
    }
}

/// Built-in functions, matched case-insensitively.
fn builtin(name: &str, now: DateTime<Local>) -> Option<String> {
    let utc: DateTime<Utc> = now.with_timezone(&Utc);
    let value = match name.to_uppercase().as_str() {
        "CURRENT_TIMESTAMP" | "NOW" => format!("'{}'", now.format("%Y-%m-%d %H:%M:%S%.3f")),
        "UTC_TIMESTAMP" => format!("'{}'", utc.format("%Y-%m-%d %H:%M:%S%.3f")),
        "CURRENT_DATE" | "TODAY" => format!("'{}'", now.format("%Y-%m-%d")),
        "CURRENT_TIME" => format!("'{}'", now.format("%H:%M:%S")),
        "UNIX_TIMESTAMP" => now.timestamp().to_string(),
        "UNIX_TIMESTAMP_MS" => now.timestamp_millis().to_string(),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_array_renders_in_list() {
        let mut store = VariableStore::new();
        store.set_static("ids", VariableValue::from_yaml(&yaml("[1, 2, 3]")));
        store.set_static("names", VariableValue::from_yaml(&yaml("[\"a\", \"O'Neil\"]")));

        let out = store.substitute("WHERE Id IN (${ids}) AND Name IN (${names})");
        assert_eq!(out.sql, "WHERE Id IN (1, 2, 3) AND Name IN ('a', 'O''Neil')");
        assert!(out.is_complete());
    }

    #[test]
    fn test_empty_array_renders_null() {
        let mut store = VariableStore::new();
        store.set_static("ids", VariableValue::Array(vec![]));
        assert_eq!(store.substitute("IN (${ids})").sql, "IN (NULL)");
    }

    #[test]
    fn test_scalar_quoting() {
        let mut store = VariableStore::new();
        store.set_static("region", VariableValue::Scalar(SqlValue::Text("EU".into())));
        store.set_static("limit", VariableValue::Scalar(SqlValue::I64(10)));
        store.set_static("active", VariableValue::Scalar(SqlValue::Bool(true)));
        let out = store.substitute("${region} ${limit} ${active}");
        assert_eq!(out.sql, "'EU' 10 1");
    }

    #[test]
    fn test_dynamic_wins_over_static() {
        let mut store = VariableStore::new();
        store.set_static("cutoff", VariableValue::Scalar(SqlValue::I64(1)));
        store.set_dynamic("cutoff", VariableValue::Scalar(SqlValue::I64(2)));
        assert_eq!(store.substitute("${cutoff}").sql, "2");
    }

    #[test]
    fn test_write_once() {
        let mut store = VariableStore::new();
        assert!(store.set_static("x", VariableValue::Scalar(SqlValue::I64(1))));
        assert!(!store.set_static("x", VariableValue::Scalar(SqlValue::I64(2))));
        assert_eq!(store.substitute("${x}").sql, "1");
    }

    #[test]
    fn test_map_key_and_flatten() {
        let mut map = IndexMap::new();
        map.insert(
            "c1".to_string(),
            VariableValue::Array(vec![SqlValue::I64(1), SqlValue::I64(2)]),
        );
        map.insert(
            "c2".to_string(),
            VariableValue::Array(vec![SqlValue::Text("x".into())]),
        );
        let mut store = VariableStore::new();
        store.set_dynamic("ref", VariableValue::Map(map));

        assert_eq!(store.substitute("${ref.c1}").sql, "1, 2");
        assert_eq!(store.substitute("${ref.C2}").sql, "'x'");
        assert_eq!(store.substitute("${ref}").sql, "1, 2, 'x'");
        let out = store.substitute("${ref.missing}");
        assert_eq!(out.unresolved, vec!["ref.missing"]);
    }

    #[test]
    fn test_map_of_scalars_flattens_all_values() {
        let mut store = VariableStore::new();
        store.set_static("codes", VariableValue::from_yaml(&yaml("{a: 1, b: 'two'}")));
        assert_eq!(store.substitute("${codes}").sql, "1, 'two'");
        assert_eq!(store.substitute("${codes.b}").sql, "'two'");
    }

    #[test]
    fn test_builtin_functions() {
        let store = VariableStore::new();
        let now = Local.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let out = store.substitute_at("${CURRENT_DATE} ${today} ${CURRENT_TIME} ${NOW}", now);
        assert_eq!(
            out.sql,
            "'2024-05-06' '2024-05-06' '07:08:09' '2024-05-06 07:08:09.000'"
        );
        let out = store.substitute_at("${UNIX_TIMESTAMP}", now);
        assert_eq!(out.sql, now.timestamp().to_string());
    }

    #[test]
    fn test_static_shadows_builtin() {
        let mut store = VariableStore::new();
        store.set_static("TODAY", VariableValue::Scalar(SqlValue::Text("fixed".into())));
        assert_eq!(store.substitute("${TODAY}").sql, "'fixed'");
    }

    #[test]
    fn test_environment_pass() {
        std::env::set_var("MSSQL_ETL_TEST_SCHEMA", "staging");
        let store = VariableStore::new();
        let out = store.substitute("SELECT * FROM ${MSSQL_ETL_TEST_SCHEMA}.T");
        assert_eq!(out.sql, "SELECT * FROM staging.T");
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        std::env::set_var("MSSQL_ETL_TEST_NESTED", "leaked");
        let mut store = VariableStore::new();
        store.set_static(
            "note",
            VariableValue::Scalar(SqlValue::Text("${MSSQL_ETL_TEST_NESTED}".into())),
        );
        store.set_dynamic(
            "label",
            VariableValue::Scalar(SqlValue::Text("${note}".into())),
        );

        let out = store.substitute("SELECT ${note}, ${label}");
        assert_eq!(out.sql, "SELECT '${MSSQL_ETL_TEST_NESTED}', '${note}'");
        assert!(out.is_complete());
    }

    #[test]
    fn test_unresolved_reported_once() {
        let store = VariableStore::new();
        let out = store.substitute("${nope} and ${nope} and ${other}");
        assert_eq!(out.unresolved, vec!["nope", "other"]);
        assert_eq!(out.sql, "${nope} and ${nope} and ${other}");
    }

    #[test]
    fn test_from_plan() {
        let vars: IndexMap<String, serde_yaml::Value> =
            serde_yaml::from_str("region: EU\nids: [1, 2]\n").unwrap();
        let store = VariableStore::from_plan(&vars);
        assert_eq!(store.len(), 2);
        let (ids, source) = store.get("ids").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(source, VariableSource::Static);
    }
}
