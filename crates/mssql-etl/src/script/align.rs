//! Column-list alignment for `INSERT INTO t (...) SELECT ...` statements.
//!
//! Hand-written scripts drift from the live schema. When the insert column
//! list is `*` or its length differs from the select list, the list is
//! rebuilt from the table's non-identity columns in ordinal order, cut to the
//! number of selected expressions.

use super::lexer::{blank_non_code, is_code_at, segments};
use crate::core::{quote_ident, TableName};
use crate::db::{Database, MetadataCache};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static INSERT_SELECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bINSERT\s+INTO\s+((?:\[[^\]]*\]|[\w#@$."])+)\s*\(([^()]*)\)\s*SELECT\s+"#)
        .expect("insert-select pattern")
});

/// Rewrite mismatched insert column lists. Returns the new text and how many
/// statements were rewritten. Statements whose table has no catalog entry
/// (temp tables, missing tables) are left unchanged.
pub async fn align_insert_selects(
    sql: &str,
    db: &dyn Database,
    metadata: &MetadataCache,
) -> (String, usize) {
    let segs = segments(sql);
    let blank = blank_non_code(sql);
    let mut replacements: Vec<(std::ops::Range<usize>, String)> = Vec::new();

    for caps in INSERT_SELECT.captures_iter(sql) {
        let (Some(whole), Some(table_m), Some(cols_m)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if !is_code_at(&segs, whole.start()) {
            continue;
        }

        let Some(from_pos) = find_top_level_from(&blank, whole.end()) else {
            continue;
        };
        let select_list = sql[whole.end()..from_pos].trim();
        if select_list == "*" || select_list.ends_with(".*") {
            continue;
        }
        let select_count = count_top_level_items(&blank[whole.end()..from_pos]);

        let declared = cols_m.as_str().trim();
        let is_star = declared == "*";
        let declared_count = count_top_level_items(&blank[cols_m.start()..cols_m.end()]);
        if !is_star && declared_count == select_count {
            continue;
        }

        let Ok(table) = TableName::parse(table_m.as_str()) else {
            continue;
        };
        let columns = match metadata.columns(db, &table).await {
            Ok(cols) if !cols.is_empty() => cols,
            Ok(_) => {
                debug!("No catalog entry for {}, INSERT left unchanged", table);
                continue;
            }
            Err(e) => {
                debug!("Catalog lookup for {} failed ({}), INSERT left unchanged", table, e);
                continue;
            }
        };

        let mut insertable: Vec<_> = columns.into_iter().filter(|c| !c.is_identity).collect();
        insertable.sort_by_key(|c| c.ordinal);
        if select_count > insertable.len() {
            warn!(
                "INSERT INTO {} selects {} columns but the table has {} insertable columns",
                table,
                select_count,
                insertable.len()
            );
        }
        insertable.truncate(select_count);

        let Ok(quoted) = insertable
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<crate::error::Result<Vec<_>>>()
        else {
            continue;
        };
        info!(
            "INSERT INTO {}: column list rebuilt ({} declared, {} selected)",
            table,
            if is_star { "*".to_string() } else { declared_count.to_string() },
            select_count
        );
        replacements.push((cols_m.range(), quoted.join(", ")));
    }

    let rewritten = replacements.len();
    let mut out = sql.to_string();
    for (range, text) in replacements.into_iter().rev() {
        out.replace_range(range, &text);
    }
    (out, rewritten)
}

/// Offset of the first `FROM` keyword at parenthesis depth zero.
fn find_top_level_from(blank: &str, from: usize) -> Option<usize> {
    let b = blank.as_bytes();
    let mut depth = 0i32;
    let mut i = from;
    while i < b.len() {
        match b[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0
                && b.len() - i >= 4
                && b[i..i + 4].eq_ignore_ascii_case(b"FROM")
                && (i == 0 || !is_word(b[i - 1]))
                && b.get(i + 4).map_or(true, |&c| !is_word(c)) =>
            {
                return Some(i);
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Comma-separated items at parenthesis depth zero.
fn count_top_level_items(blank: &str) -> usize {
    if blank.trim().is_empty() {
        return 0;
    }
    let mut depth = 0i32;
    let mut count = 1;
    for c in blank.bytes() {
        match c {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b',' if depth == 0 => count += 1,
            _ => {}
        }
    }
    count
}

fn is_word(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'@' || c == b'#' || c == b'$'
}
