//! Identifier validation, parsing and quoting for T-SQL.
//!
//! Table and column names arrive from plan files written by hand, so they show
//! up bracketed (`[dbo].[Orders]`), bare (`Orders`) or schema-qualified
//! (`dbo.Orders`). Everything that builds SQL goes through [`quote_ident`] and
//! [`TableName::quoted`]; everything that compares names goes through
//! [`TableName::key`].
//!
//! # Security
//!
//! Identifiers cannot be bound as parameters, so they are validated (no null
//! bytes, bounded length) and bracket-quoted with `]` doubled.

use crate::error::{MigrateError, Result};

/// Maximum identifier length for SQL Server.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Schema assumed when a table name is not qualified.
pub const DEFAULT_SCHEMA: &str = "dbo";

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_ident("users")?, "[users]");
/// assert_eq!(quote_ident("table]name")?, "[table]]name]");
/// ```
pub fn quote_ident(name: &str) -> Result<String> {
    let name = strip_quotes(name);
    validate_identifier(&name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Remove one level of `[...]` or `"..."` quoting from a name part.
pub fn strip_quotes(part: &str) -> String {
    let part = part.trim();
    if part.len() >= 2 && part.starts_with('[') && part.ends_with(']') {
        part[1..part.len() - 1].replace("]]", "]")
    } else if part.len() >= 2 && part.starts_with('"') && part.ends_with('"') {
        part[1..part.len() - 1].replace("\"\"", "\"")
    } else {
        part.to_string()
    }
}

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Parse `name`, `schema.name`, `[schema].[name]` or `db.schema.name`
    /// (the database part is dropped).
    pub fn parse(raw: &str) -> Result<Self> {
        let parts = split_name_parts(raw.trim());
        let (schema, name) = match parts.as_slice() {
            [name] => (None, name.clone()),
            [schema, name] => (Some(schema.clone()), name.clone()),
            [_, schema, name] => (Some(schema.clone()), name.clone()),
            _ => {
                return Err(MigrateError::Config(format!(
                    "Invalid table name: {:?}",
                    raw
                )))
            }
        };
        validate_identifier(&name)?;
        if let Some(ref s) = schema {
            validate_identifier(s)?;
        }
        Ok(Self { schema, name })
    }

    /// Schema, defaulting to `dbo`.
    pub fn schema_or_default(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    /// Temp tables (`#t`, `##t`) live in tempdb and have no catalog entry here.
    pub fn is_temp(&self) -> bool {
        self.name.starts_with('#')
    }

    /// Bracket-quoted form, `[schema].[name]`, or `[#name]` for temp tables.
    pub fn quoted(&self) -> Result<String> {
        if self.is_temp() {
            return quote_ident(&self.name);
        }
        Ok(format!(
            "{}.{}",
            quote_ident(self.schema_or_default())?,
            quote_ident(&self.name)?
        ))
    }

    /// Case-insensitive comparison key, `schema.name` lowercased.
    pub fn key(&self) -> String {
        format!(
            "{}.{}",
            self.schema_or_default().to_lowercase(),
            self.name.to_lowercase()
        )
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.schema {
            Some(ref s) => write!(f, "{}.{}", s, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split on dots that are not inside brackets or double quotes.
fn split_name_parts(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;
    let mut in_quote = false;

    for c in raw.chars() {
        match c {
            '[' if !in_quote => {
                in_bracket = true;
                current.push(c);
            }
            ']' if !in_quote => {
                in_bracket = false;
                current.push(c);
            }
            '"' if !in_bracket => {
                in_quote = !in_quote;
                current.push(c);
            }
            '.' if !in_bracket && !in_quote => {
                parts.push(strip_quotes(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    parts.push(strip_quotes(&current));
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(validate_identifier(&long_name).is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
    }

    #[test]
    fn test_quote_ident_escapes_bracket() {
        assert_eq!(quote_ident("users").unwrap(), "[users]");
        assert_eq!(quote_ident("table]name").unwrap(), "[table]]name]");
        assert_eq!(quote_ident("[Already]").unwrap(), "[Already]");
    }

    #[test]
    fn test_quote_ident_sql_injection_safely_quoted() {
        let quoted = quote_ident("x]; DROP TABLE users; --").unwrap();
        assert_eq!(quoted, "[x]]; DROP TABLE users; --]");
    }

    #[test]
    fn test_parse_table_names() {
        let t = TableName::parse("Orders").unwrap();
        assert_eq!(t.schema, None);
        assert_eq!(t.key(), "dbo.orders");

        let t = TableName::parse("[sales].[Order Lines]").unwrap();
        assert_eq!(t.schema.as_deref(), Some("sales"));
        assert_eq!(t.name, "Order Lines");
        assert_eq!(t.quoted().unwrap(), "[sales].[Order Lines]");

        let t = TableName::parse("db.dbo.T").unwrap();
        assert_eq!(t.key(), "dbo.t");
    }

    #[test]
    fn test_parse_keeps_dots_inside_brackets() {
        let t = TableName::parse("[odd.name]").unwrap();
        assert_eq!(t.name, "odd.name");
    }

    #[test]
    fn test_temp_table() {
        let t = TableName::parse("#staging").unwrap();
        assert!(t.is_temp());
        assert_eq!(t.quoted().unwrap(), "[#staging]");
    }

    #[test]
    fn test_keys_match_across_spellings() {
        let a = TableName::parse("dbo.Customers").unwrap();
        let b = TableName::parse("[CUSTOMERS]").unwrap();
        assert_eq!(a.key(), b.key());
    }
}
