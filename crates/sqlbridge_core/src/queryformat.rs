use bitflags::bitflags;

use crate::error::{ErrorKind, SqlError};

bitflags! {
    /// Behavior flags for [`format_query`]. Each driver passes the set
    /// matching its backend's placeholder convention and insert handling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFormatFlags: u32 {
        /// The backend requires a trailing `;`. Default is to strip one.
        const TERMINATOR_REQUIRED         = 1 << 0;
        /// Rewrite `?` placeholders to `$1..$N` (PostgreSQL).
        const ENUMPARAM_DOLLAR            = 1 << 1;
        /// Rewrite `?` placeholders to `:1..:N` (Oracle).
        const ENUMPARAM_COLON             = 1 << 2;
        /// The backend takes multi-row insertions as a comma-delimited
        /// `VALUES (...), (...)` list rather than rows of bound parameters.
        const MULTIVALUEINSERT_CD         = 1 << 3;
        /// Append the backend clause that skips conflicting inserts instead
        /// of aborting. The execution layer compares affected rows against
        /// expected rows and synthesizes `QueryConstraint` on a shortfall.
        const INSERT_ONCONFLICT_DONOTHING = 1 << 4;
    }
}

/// Scanner over a query that is aware of double-quoted identifiers,
/// dollar-quoted strings, and SQL comments. Single-quoted string literals
/// are rejected outright: user data must arrive as bound parameters, an
/// inline literal is almost always an injection hazard or a typo.
struct QueryScanner<'a> {
    rest: &'a str,
}

/// One lexical piece of the query.
enum Piece<'a> {
    /// Verbatim text (identifiers, keywords, quoted regions, comments).
    Verbatim(&'a str),
    /// A `?` placeholder.
    Placeholder,
    /// A `;` terminator.
    Terminator,
}

impl<'a> QueryScanner<'a> {
    fn new(query: &'a str) -> Self {
        Self { rest: query }
    }

    fn next_piece(&mut self) -> Result<Option<Piece<'a>>, SqlError> {
        let rest = self.rest;
        if rest.is_empty() {
            return Ok(None);
        }
        let bytes = rest.as_bytes();

        match bytes[0] {
            b'?' => {
                self.rest = &rest[1..];
                return Ok(Some(Piece::Placeholder));
            }
            b';' => {
                self.rest = &rest[1..];
                return Ok(Some(Piece::Terminator));
            }
            b'\'' => {
                return Err(SqlError::new(
                    ErrorKind::PrepareStrNotBound,
                    "string literal in query; values must be bound parameters",
                ));
            }
            b'"' => {
                // Quoted identifier: runs to the closing quote, doubled
                // quotes inside are part of the identifier.
                let mut idx = 1;
                loop {
                    match rest[idx..].find('"') {
                        Some(pos) => {
                            idx += pos + 1;
                            if rest[idx..].starts_with('"') {
                                idx += 1;
                            } else {
                                break;
                            }
                        }
                        None => {
                            return Err(SqlError::new(
                                ErrorKind::PrepareInvalid,
                                "unterminated quoted identifier",
                            ));
                        }
                    }
                }
                let (piece, rest) = rest.split_at(idx);
                self.rest = rest;
                return Ok(Some(Piece::Verbatim(piece)));
            }
            b'$' => {
                // Possible dollar-quoted string: $tag$ ... $tag$. Preserved
                // verbatim when balanced.
                if let Some(tag_len) = dollar_tag_len(rest) {
                    let open = &rest[..tag_len];
                    match rest[tag_len..].find(open) {
                        Some(pos) => {
                            let end = tag_len + pos + tag_len;
                            let (piece, rest) = rest.split_at(end);
                            self.rest = rest;
                            return Ok(Some(Piece::Verbatim(piece)));
                        }
                        None => {
                            return Err(SqlError::new(
                                ErrorKind::PrepareInvalid,
                                "unbalanced dollar-quoted string",
                            ));
                        }
                    }
                }
            }
            b'-' if rest.starts_with("--") => {
                let end = rest.find('\n').map(|p| p + 1).unwrap_or(rest.len());
                let (piece, rest) = rest.split_at(end);
                self.rest = rest;
                return Ok(Some(Piece::Verbatim(piece)));
            }
            b'/' if rest.starts_with("/*") => match rest.find("*/") {
                Some(pos) => {
                    let (piece, rest) = rest.split_at(pos + 2);
                    self.rest = rest;
                    return Ok(Some(Piece::Verbatim(piece)));
                }
                None => {
                    return Err(SqlError::new(
                        ErrorKind::PrepareInvalid,
                        "unterminated comment",
                    ));
                }
            },
            _ => {}
        }

        // Plain text: run to the next character of interest.
        let end = rest
            .char_indices()
            .skip(1)
            .find(|&(idx, ch)| {
                matches!(ch, '?' | ';' | '\'' | '"' | '$')
                    || rest[idx..].starts_with("--")
                    || rest[idx..].starts_with("/*")
            })
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let (piece, rest) = rest.split_at(end);
        self.rest = rest;
        Ok(Some(Piece::Verbatim(piece)))
    }
}

fn dollar_tag_len(input: &str) -> Option<usize> {
    // $$ or $ident$
    let inner_end = input[1..]
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_'))?;
    if inner_end.1 == '$' {
        Some(1 + inner_end.0 + 1)
    } else {
        None
    }
}

/// Count the `?` placeholders in a query, validating quoting along the way.
pub fn count_placeholders(query: &str) -> Result<usize, SqlError> {
    let mut scanner = QueryScanner::new(query);
    let mut count = 0;
    while let Some(piece) = scanner.next_piece()? {
        if matches!(piece, Piece::Placeholder) {
            count += 1;
        }
    }
    Ok(count)
}

/// Rewrite a placeholder-agnostic query into the backend's convention.
///
/// This is the shared helper drivers delegate their `query_format` to; a
/// driver whose backend needs something beyond the flag set implements its
/// own. `num_params` is placeholders per row, `num_rows` the number of bind
/// rows consumed by this execution (multi-row expansion replicates the
/// `VALUES` group that many times).
pub fn format_query(
    query: &str,
    flags: QueryFormatFlags,
    num_params: usize,
    num_rows: usize,
) -> Result<String, SqlError> {
    // Pass 1: validate quoting, strip the terminator, reject multi-query.
    let mut scanner = QueryScanner::new(query);
    let mut body = String::with_capacity(query.len() + 16);
    let mut saw_terminator = false;
    while let Some(piece) = scanner.next_piece()? {
        if saw_terminator {
            let trailing = match &piece {
                Piece::Verbatim(text) => text.trim().is_empty(),
                _ => false,
            };
            if !trailing {
                return Err(SqlError::new(
                    ErrorKind::PrepareNoMultiQuery,
                    "only a single query per statement is allowed",
                ));
            }
            continue;
        }
        match piece {
            Piece::Verbatim(text) => body.push_str(text),
            Piece::Placeholder => body.push('?'),
            Piece::Terminator => saw_terminator = true,
        }
    }
    let mut body = body.trim_end().to_string();

    let is_insert = first_keyword_is(&body, "INSERT");

    // Multi-row expansion: replicate the final VALUES group.
    if flags.contains(QueryFormatFlags::MULTIVALUEINSERT_CD) && is_insert && num_rows > 1 {
        body = expand_values_group(&body, num_rows)?;
    }

    if flags.contains(QueryFormatFlags::INSERT_ONCONFLICT_DONOTHING) && is_insert {
        body.push_str(" ON CONFLICT DO NOTHING");
    }

    // Sanity: total placeholders must match the bound parameter shape.
    if num_params > 0 {
        let expect = if flags.contains(QueryFormatFlags::MULTIVALUEINSERT_CD) && is_insert {
            num_params * num_rows.max(1)
        } else {
            num_params
        };
        let got = count_placeholders(&body)?;
        if got != expect {
            return Err(SqlError::new(
                ErrorKind::QueryWrongNumParams,
                format!("query has {got} placeholders, {expect} parameters bound"),
            ));
        }
    }

    // Pass 2: renumber placeholders if the backend enumerates them.
    let style = if flags.contains(QueryFormatFlags::ENUMPARAM_DOLLAR) {
        Some('$')
    } else if flags.contains(QueryFormatFlags::ENUMPARAM_COLON) {
        Some(':')
    } else {
        None
    };
    if let Some(prefix) = style {
        let mut scanner = QueryScanner::new(&body);
        let mut out = String::with_capacity(body.len() + 32);
        let mut n = 0;
        while let Some(piece) = scanner.next_piece()? {
            match piece {
                Piece::Verbatim(text) => out.push_str(text),
                Piece::Placeholder => {
                    n += 1;
                    out.push(prefix);
                    out.push_str(&n.to_string());
                }
                Piece::Terminator => out.push(';'),
            }
        }
        body = out;
    }

    if flags.contains(QueryFormatFlags::TERMINATOR_REQUIRED) {
        body.push(';');
    }

    Ok(body)
}

fn first_keyword_is(query: &str, keyword: &str) -> bool {
    first_keyword(query)
        .map(|word| word.eq_ignore_ascii_case(keyword))
        .unwrap_or(false)
}

/// First token of the query, skipping whitespace and comments. Used both by
/// the rewriter and by the pool's read-only routing decision.
pub fn first_keyword(query: &str) -> Option<&str> {
    let mut rest = query;
    loop {
        rest = rest.trim_start();
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = stripped.split_once("*/").map(|(_, tail)| tail)?;
        } else {
            break;
        }
    }
    let end = rest
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_alphanumeric())
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len());
    if end == 0 { None } else { Some(&rest[..end]) }
}

/// Replicate the final `VALUES (...)` group of an INSERT `num_rows` times.
fn expand_values_group(query: &str, num_rows: usize) -> Result<String, SqlError> {
    let upper = query.to_ascii_uppercase();
    let values_pos = upper.rfind("VALUES").ok_or_else(|| {
        SqlError::new(
            ErrorKind::PrepareInvalid,
            "multi-row insert requires a VALUES clause",
        )
    })?;

    let after_values = values_pos + "VALUES".len();
    let open_rel = query[after_values..].find('(').ok_or_else(|| {
        SqlError::new(
            ErrorKind::PrepareInvalid,
            "multi-row insert requires a parenthesized VALUES group",
        )
    })?;
    let open = after_values + open_rel;

    let mut depth = 0usize;
    let mut close = None;
    for (idx, ch) in query[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close.ok_or_else(|| {
        SqlError::new(ErrorKind::PrepareInvalid, "unbalanced VALUES group")
    })?;

    let group = &query[open..=close];
    let mut out = String::with_capacity(query.len() + (group.len() + 2) * (num_rows - 1));
    out.push_str(&query[..open]);
    for row in 0..num_rows {
        if row > 0 {
            out.push_str(", ");
        }
        out.push_str(group);
    }
    out.push_str(&query[close + 1..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_terminator_by_default() {
        let out = format_query("SELECT 1;", QueryFormatFlags::empty(), 0, 0).unwrap();
        assert_eq!(out, "SELECT 1");

        let out = format_query("SELECT 1", QueryFormatFlags::TERMINATOR_REQUIRED, 0, 0).unwrap();
        assert_eq!(out, "SELECT 1;");
    }

    #[test]
    fn rejects_multiple_queries() {
        let err = format_query("SELECT 1; SELECT 2", QueryFormatFlags::empty(), 0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrepareNoMultiQuery);
    }

    #[test]
    fn rejects_inline_string_literals() {
        let err = format_query(
            "INSERT INTO t VALUES ('inline')",
            QueryFormatFlags::empty(),
            0,
            1,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrepareStrNotBound);
    }

    #[test]
    fn dollar_placeholders_skip_quoted_identifiers() {
        let out = format_query(
            "SELECT \"a?b\" FROM t WHERE x = ? AND y = ?",
            QueryFormatFlags::ENUMPARAM_DOLLAR,
            2,
            1,
        )
        .unwrap();
        assert_eq!(out, "SELECT \"a?b\" FROM t WHERE x = $1 AND y = $2");
    }

    #[test]
    fn colon_placeholders_renumber() {
        let out = format_query(
            "UPDATE t SET a = ?, b = ? WHERE c = ?",
            QueryFormatFlags::ENUMPARAM_COLON,
            3,
            1,
        )
        .unwrap();
        assert_eq!(out, "UPDATE t SET a = :1, b = :2 WHERE c = :3");
    }

    #[test]
    fn dollar_quoted_strings_pass_through() {
        let out = format_query(
            "SELECT $tag$? not a placeholder$tag$ FROM t WHERE x = ?",
            QueryFormatFlags::ENUMPARAM_DOLLAR,
            1,
            1,
        )
        .unwrap();
        assert_eq!(
            out,
            "SELECT $tag$? not a placeholder$tag$ FROM t WHERE x = $1"
        );
    }

    #[test]
    fn multirow_insert_expands_and_renumbers() {
        let flags = QueryFormatFlags::ENUMPARAM_DOLLAR | QueryFormatFlags::MULTIVALUEINSERT_CD;
        let out = format_query("INSERT INTO t VALUES (?, ?)", flags, 2, 3).unwrap();
        assert_eq!(
            out,
            "INSERT INTO t VALUES ($1, $2), ($3, $4), ($5, $6)"
        );
    }

    #[test]
    fn multirow_insert_plain_question_marks() {
        let out = format_query(
            "INSERT INTO t (a, b) VALUES (?, ?)",
            QueryFormatFlags::MULTIVALUEINSERT_CD,
            2,
            2,
        )
        .unwrap();
        assert_eq!(out, "INSERT INTO t (a, b) VALUES (?, ?), (?, ?)");
    }

    #[test]
    fn onconflict_appended_to_inserts_only() {
        let flags = QueryFormatFlags::INSERT_ONCONFLICT_DONOTHING;
        let out = format_query("INSERT INTO t VALUES (?)", flags, 1, 1).unwrap();
        assert_eq!(out, "INSERT INTO t VALUES (?) ON CONFLICT DO NOTHING");

        let out = format_query("SELECT x FROM t", flags, 0, 0).unwrap();
        assert_eq!(out, "SELECT x FROM t");
    }

    #[test]
    fn wrong_parameter_count_is_detected() {
        let err = format_query(
            "INSERT INTO t VALUES (?, ?)",
            QueryFormatFlags::empty(),
            3,
            1,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryWrongNumParams);
    }

    #[test]
    fn first_keyword_skips_comments() {
        assert_eq!(first_keyword("  -- note\n SELECT 1"), Some("SELECT"));
        assert_eq!(first_keyword("/* x */ insert into t"), Some("insert"));
        assert_eq!(first_keyword("   "), None);
        assert_eq!(first_keyword("-- only a comment"), None);
    }
}
