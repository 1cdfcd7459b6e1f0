//! Single read-only SELECT validation for query source text.

use super::lexer::mask_literals;
use crate::error::{MigrateError, Result};
use regex::Regex;
use std::sync::LazyLock;

static LEADING_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*\(*\s*(SELECT|WITH)\b").expect("leading keyword pattern"));

static FORBIDDEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(BEGIN\s+TRAN(?:SACTION)?|SAVE\s+TRAN(?:SACTION)?|COMMIT|ROLLBACK|INSERT|UPDATE|DELETE|MERGE|DROP|CREATE|ALTER|TRUNCATE|EXEC|EXECUTE|GRANT|REVOKE|DENY|BULK|INTO)\b",
    )
    .expect("forbidden keyword pattern")
});

/// Check that `sql` is exactly one read-only SELECT (or WITH ... SELECT).
///
/// Comments, string literals and bracketed identifiers are ignored. One
/// trailing `;` is allowed.
pub fn validate_single_select(query_id: &str, sql: &str) -> Result<()> {
    let masked = mask_literals(sql);
    let body = masked.trim();

    if body.is_empty() {
        return Err(MigrateError::validation(query_id, "query is empty"));
    }
    if !LEADING_KEYWORD.is_match(body) {
        return Err(MigrateError::validation(
            query_id,
            "query must start with SELECT or WITH",
        ));
    }

    let body = body.strip_suffix(';').unwrap_or(body);
    if body.contains(';') {
        return Err(MigrateError::validation(
            query_id,
            "query contains more than one statement",
        ));
    }
    if body.lines().any(|l| l.trim().eq_ignore_ascii_case("go")) {
        return Err(MigrateError::validation(query_id, "query contains a GO batch separator"));
    }

    if let Some(m) = FORBIDDEN.find(body) {
        let keyword = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
        let message = if keyword.eq_ignore_ascii_case("into") {
            "SELECT ... INTO is not allowed".to_string()
        } else {
            format!("keyword {} is not allowed", keyword.to_uppercase())
        };
        return Err(MigrateError::validation(query_id, message));
    }

    Ok(())
}
