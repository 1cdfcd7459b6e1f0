//! Quote-aware scanning of T-SQL text.
//!
//! The scanner splits text into code, quoted runs (`'...'`, `"..."`,
//! `[...]`, each with doubled-delimiter escapes) and comments (`-- ...`,
//! nested `/* ... */`). Comment stripping, statement splitting and the
//! validator's literal masking are all built on it.

/// Kind of a scanned run of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    SingleQuoted,
    DoubleQuoted,
    Bracketed,
    LineComment,
    BlockComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub kind: SegmentKind,
    pub text: &'a str,
    /// Byte offset of `text` in the scanned string.
    pub start: usize,
}

/// Scan `sql` into segments. Unterminated quotes and comments run to the end.
pub fn segments(sql: &str) -> Vec<Segment<'_>> {
    let b = sql.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < b.len() {
        let (kind, end) = match b[i] {
            b'\'' => (SegmentKind::SingleQuoted, quoted_end(b, i, b'\'')),
            b'"' => (SegmentKind::DoubleQuoted, quoted_end(b, i, b'"')),
            b'[' => (SegmentKind::Bracketed, quoted_end(b, i, b']')),
            b'-' if b.get(i + 1) == Some(&b'-') => {
                let end = b[i..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(b.len(), |p| i + p);
                (SegmentKind::LineComment, end)
            }
            b'/' if b.get(i + 1) == Some(&b'*') => (SegmentKind::BlockComment, block_end(b, i)),
            _ => {
                i += 1;
                continue;
            }
        };
        push(&mut out, sql, SegmentKind::Code, start, i);
        push(&mut out, sql, kind, i, end);
        i = end;
        start = end;
    }
    push(&mut out, sql, SegmentKind::Code, start, b.len());
    out
}

fn push<'a>(out: &mut Vec<Segment<'a>>, sql: &'a str, kind: SegmentKind, from: usize, to: usize) {
    if to > from {
        out.push(Segment {
            kind,
            text: &sql[from..to],
            start: from,
        });
    }
}

fn quoted_end(b: &[u8], open: usize, close: u8) -> usize {
    let mut j = open + 1;
    while j < b.len() {
        if b[j] == close {
            if b.get(j + 1) == Some(&close) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    b.len()
}

fn block_end(b: &[u8], open: usize) -> usize {
    let mut depth = 1;
    let mut j = open + 2;
    while j < b.len() && depth > 0 {
        if b[j] == b'/' && b.get(j + 1) == Some(&b'*') {
            depth += 1;
            j += 2;
        } else if b[j] == b'*' && b.get(j + 1) == Some(&b'/') {
            depth -= 1;
            j += 2;
        } else {
            j += 1;
        }
    }
    j.min(b.len())
}

/// Remove comments, leaving quoted text untouched. Block comments become a
/// single space so adjacent tokens stay separated.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for seg in segments(sql) {
        match seg.kind {
            SegmentKind::BlockComment => out.push(' '),
            SegmentKind::LineComment => {}
            _ => out.push_str(seg.text),
        }
    }
    out
}

/// Split a script into statements on `;` and on lines consisting solely of
/// `GO`, ignoring both inside quotes and comments. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let segs = segments(sql);
    let mut statements = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, statements: &mut Vec<String>| {
        let stmt = current.trim();
        if !stmt.is_empty() {
            statements.push(stmt.to_string());
        }
        current.clear();
    };

    for (si, seg) in segs.iter().enumerate() {
        if seg.kind != SegmentKind::Code {
            current.push_str(seg.text);
            continue;
        }
        let is_last = si + 1 == segs.len();
        let mut lines = seg.text.split_inclusive('\n').peekable();
        while let Some(line) = lines.next() {
            let terminated = line.ends_with('\n') || (is_last && lines.peek().is_none());
            let at_line_start = current.trim_end_matches([' ', '\t']).is_empty()
                || current.trim_end_matches([' ', '\t']).ends_with('\n');
            if terminated && at_line_start && line.trim().eq_ignore_ascii_case("go") {
                flush(&mut current, &mut statements);
                continue;
            }

            let mut pieces = line.split(';');
            if let Some(first) = pieces.next() {
                current.push_str(first);
            }
            for piece in pieces {
                flush(&mut current, &mut statements);
                current.push_str(piece);
            }
        }
    }
    flush(&mut current, &mut statements);
    statements
}

/// Comments removed and quoted content blanked, for keyword inspection.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for seg in segments(sql) {
        match seg.kind {
            SegmentKind::Code => out.push_str(seg.text),
            SegmentKind::SingleQuoted => out.push_str("''"),
            SegmentKind::DoubleQuoted | SegmentKind::Bracketed => out.push_str("[x]"),
            SegmentKind::LineComment | SegmentKind::BlockComment => out.push(' '),
        }
    }
    out
}

/// Same byte length as `sql`, with every quote and comment byte replaced by a
/// space. Offsets into the result are valid offsets into `sql`.
pub fn blank_non_code(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for seg in segments(sql) {
        if seg.kind == SegmentKind::Code {
            out.push_str(seg.text);
        } else {
            out.extend(std::iter::repeat(' ').take(seg.text.len()));
        }
    }
    out
}

/// Whether byte offset `pos` falls in code (not in a quote or comment).
pub fn is_code_at(segs: &[Segment<'_>], pos: usize) -> bool {
    segs.iter()
        .find(|s| pos >= s.start && pos < s.start + s.text.len())
        .map_or(true, |s| s.kind == SegmentKind::Code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments_is_quote_aware() {
        let sql = "SELECT '--not a comment' AS a -- real comment\nFROM t /* block */ WHERE x = 1";
        assert_eq!(
            strip_comments(sql),
            "SELECT '--not a comment' AS a \nFROM t   WHERE x = 1"
        );
    }

    #[test]
    fn test_nested_block_comment() {
        assert_eq!(strip_comments("a /* x /* y */ z */ b"), "a   b");
    }

    #[test]
    fn test_bracketed_identifier_with_comment_chars() {
        let sql = "SELECT [col--1], [a]]b] FROM t";
        assert_eq!(strip_comments(sql), sql);
    }

    #[test]
    fn test_split_on_semicolons_outside_quotes() {
        let stmts = split_statements("INSERT INTO t VALUES ('a;b'); UPDATE t SET x = 1;;\n");
        assert_eq!(
            stmts,
            vec!["INSERT INTO t VALUES ('a;b')", "UPDATE t SET x = 1"]
        );
    }

    #[test]
    fn test_split_on_go_lines() {
        let script = "CREATE TABLE #t (id int)\nGO\nINSERT INTO #t VALUES (1)\n  go  \nSELECT 'GO'\nGO";
        let stmts = split_statements(script);
        assert_eq!(
            stmts,
            vec![
                "CREATE TABLE #t (id int)",
                "INSERT INTO #t VALUES (1)",
                "SELECT 'GO'",
            ]
        );
    }

    #[test]
    fn test_go_inside_identifier_is_not_a_separator() {
        let stmts = split_statements("SELECT category\nFROM goals");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_escaped_quotes() {
        let stmts = split_statements("SELECT 'it''s; fine'; SELECT 2");
        assert_eq!(stmts, vec!["SELECT 'it''s; fine'", "SELECT 2"]);
    }

    #[test]
    fn test_mask_literals() {
        assert_eq!(
            mask_literals("SELECT 'DELETE' AS [Update] -- DROP\nFROM t"),
            "SELECT '' AS [x]  \nFROM t"
        );
    }

    #[test]
    fn test_blank_non_code_keeps_offsets() {
        let sql = "SELECT 'é;x' FROM t";
        let blank = blank_non_code(sql);
        assert_eq!(blank.len(), sql.len());
        assert_eq!(blank.find("FROM"), sql.find("FROM"));
        assert!(!blank.contains(';'));
    }

    #[test]
    fn test_unterminated_quote_runs_to_end() {
        let segs = segments("SELECT 'abc");
        assert_eq!(segs.last().unwrap().kind, SegmentKind::SingleQuoted);
    }
}
