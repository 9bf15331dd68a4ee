//! Row-limit rewriting: trailing LIMIT/OFFSET detection, COUNT wrapping and
//! page suffixes. Every rewritten statement goes back through the guard.

use crate::guard::{GuardError, ValidatedSql, assert_safe_select};
use crate::lexer::{Token, TokenKind, tokenize};

/// Text placed before the caller's query when counting its rows.
pub(crate) const COUNT_PREFIX: &str = "SELECT COUNT(*) FROM (\n";
const COUNT_SUFFIX: &str = "\n) AS count_query";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LimitArg {
    Rows(u64),
    All,
    /// A bound parameter or anything else whose value is unknown here.
    Opaque,
}

/// A validated query split into its body and any trailing LIMIT/OFFSET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LimitScan {
    /// The query with its trailing LIMIT/OFFSET/FETCH clauses removed and its
    /// `$n` markers renumbered to `$1..$k` in order of first use.
    pub body: String,
    /// Original 1-based marker numbers still referenced by `body`, indexed by
    /// their new number minus one.
    pub markers: Vec<usize>,
    pub trailing_limit: Option<LimitArg>,
    /// True if the top level of the query has a LIMIT or FETCH anywhere.
    pub has_limit: bool,
}

impl LimitScan {
    /// Picks the bound values `body` still needs, in their new order.
    pub fn retained_values<T: Clone>(&self, values: &[T]) -> Vec<T> {
        self.markers
            .iter()
            .filter_map(|marker| values.get(marker.checked_sub(1)?).cloned())
            .collect()
    }
}

pub(crate) fn scan_limit(sql: &ValidatedSql) -> Result<LimitScan, GuardError> {
    let text = sql.as_str();
    let tokens = tokenize(text)?;

    let mut depth = 0usize;
    let mut top_level = Vec::with_capacity(tokens.len());
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            _ if depth == 0 => top_level.push(idx),
            _ => {}
        }
    }

    let has_limit = top_level
        .iter()
        .any(|&idx| tokens[idx].is_keyword("LIMIT") || tokens[idx].is_keyword("FETCH"));

    for &idx in &top_level {
        let token = &tokens[idx];
        if !(token.is_keyword("LIMIT") || token.is_keyword("OFFSET") || token.is_keyword("FETCH")) {
            continue;
        }
        if let Some(trailing_limit) = parse_tail(&tokens[idx..]) {
            let (body, markers) = renumber_markers(text, &tokens[..idx], token.span.start);
            return Ok(LimitScan {
                body: body.trim_end().to_string(),
                markers,
                trailing_limit,
                has_limit,
            });
        }
    }

    let (body, markers) = renumber_markers(text, &tokens, text.len());
    Ok(LimitScan {
        body,
        markers,
        trailing_limit: None,
        has_limit,
    })
}

/// Copies `text[..end]` with the `$n` markers among `tokens` renumbered to
/// `$1..$k` by first use. Also returns the original number behind each new one.
fn renumber_markers(text: &str, tokens: &[Token<'_>], end: usize) -> (String, Vec<usize>) {
    let mut markers: Vec<usize> = Vec::new();
    let mut body = String::with_capacity(end);
    let mut copied = 0;
    for token in tokens.iter().filter(|token| token.kind == TokenKind::Positional) {
        let Ok(original) = token.text[1..].parse::<usize>() else {
            continue;
        };
        let renumbered = match markers.iter().position(|&seen| seen == original) {
            Some(idx) => idx + 1,
            None => {
                markers.push(original);
                markers.len()
            }
        };
        body.push_str(&text[copied..token.span.start]);
        body.push_str(&format!("${renumbered}"));
        copied = token.span.end;
    }
    body.push_str(&text[copied..end]);
    (body, markers)
}

/// Matches `[LIMIT arg | FETCH ..] [OFFSET arg [ROW|ROWS]]` in either order up
/// to the end of the statement. Returns the row limit if there was one.
fn parse_tail(tokens: &[Token<'_>]) -> Option<Option<LimitArg>> {
    let mut limit = None;
    let mut seen_offset = false;
    let mut idx = 0;
    while idx < tokens.len() {
        let token = &tokens[idx];
        if token.is_keyword("FETCH") && limit.is_none() {
            let (arg, consumed) = parse_fetch(&tokens[idx..])?;
            limit = Some(arg);
            idx += consumed;
            continue;
        }
        let arg = tokens.get(idx + 1)?;
        if token.is_keyword("LIMIT") && limit.is_none() {
            limit = Some(match arg.kind {
                TokenKind::Number => LimitArg::Rows(arg.text.parse().ok()?),
                TokenKind::Positional => LimitArg::Opaque,
                TokenKind::Word if arg.text.eq_ignore_ascii_case("ALL") => LimitArg::All,
                _ => return None,
            });
            idx += 2;
        } else if token.is_keyword("OFFSET") && !seen_offset {
            if !matches!(arg.kind, TokenKind::Number | TokenKind::Positional) {
                return None;
            }
            seen_offset = true;
            idx += 2;
            if tokens
                .get(idx)
                .is_some_and(|next| next.is_keyword("ROW") || next.is_keyword("ROWS"))
            {
                idx += 1;
            }
        } else {
            return None;
        }
    }
    Some(limit)
}

/// Matches `FETCH {FIRST|NEXT} [n] {ROW|ROWS} ONLY`. A missing count means one
/// row. `WITH TIES` is left in place.
fn parse_fetch(tokens: &[Token<'_>]) -> Option<(LimitArg, usize)> {
    let first = tokens.get(1)?;
    if !(first.is_keyword("FIRST") || first.is_keyword("NEXT")) {
        return None;
    }
    let mut idx = 2;
    let arg = match tokens.get(idx)?.kind {
        TokenKind::Number => {
            let rows = tokens[idx].text.parse().ok()?;
            idx += 1;
            LimitArg::Rows(rows)
        }
        TokenKind::Positional => {
            idx += 1;
            LimitArg::Opaque
        }
        _ => LimitArg::Rows(1),
    };
    let unit = tokens.get(idx)?;
    if !(unit.is_keyword("ROW") || unit.is_keyword("ROWS")) {
        return None;
    }
    if !tokens.get(idx + 1)?.is_keyword("ONLY") {
        return None;
    }
    Some((arg, idx + 2))
}

/// `SELECT COUNT(*)` over the whole of `body`.
pub(crate) fn count_query(body: &str) -> Result<ValidatedSql, GuardError> {
    assert_safe_select(&format!("{COUNT_PREFIX}{body}{COUNT_SUFFIX}"))
}

pub(crate) fn page_query(body: &str, limit: u64, offset: u64) -> Result<ValidatedSql, GuardError> {
    assert_safe_select(&format!("{body}\nLIMIT {limit} OFFSET {offset}"))
}

pub(crate) fn capped_query(body: &str, max_rows: usize) -> Result<ValidatedSql, GuardError> {
    assert_safe_select(&format!("{body}\nLIMIT {max_rows}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(sql: &str) -> LimitScan {
        scan_limit(&assert_safe_select(sql).expect("valid")).expect("scan")
    }

    #[test]
    fn strips_trailing_limit_and_offset() {
        let scanned = scan("SELECT id FROM users ORDER BY id LIMIT 5 OFFSET 10");
        assert_eq!(scanned.body, "SELECT id FROM users ORDER BY id");
        assert_eq!(scanned.trailing_limit, Some(LimitArg::Rows(5)));
        assert!(scanned.has_limit);

        let scanned = scan("SELECT id FROM users OFFSET 3 ROWS limit all");
        assert_eq!(scanned.body, "SELECT id FROM users");
        assert_eq!(scanned.trailing_limit, Some(LimitArg::All));

        let scanned = scan("SELECT id FROM users WHERE id > $1 LIMIT $2");
        assert_eq!(scanned.body, "SELECT id FROM users WHERE id > $1");
        assert_eq!(scanned.trailing_limit, Some(LimitArg::Opaque));
    }

    #[test]
    fn offset_without_limit_is_stripped() {
        let scanned = scan("SELECT id FROM users OFFSET 20");
        assert_eq!(scanned.body, "SELECT id FROM users");
        assert_eq!(scanned.trailing_limit, None);
        assert!(!scanned.has_limit);
    }

    #[test]
    fn nested_limits_are_left_alone() {
        let scanned = scan("SELECT * FROM (SELECT id FROM users LIMIT 3) AS top3");
        assert_eq!(scanned.body, "SELECT * FROM (SELECT id FROM users LIMIT 3) AS top3");
        assert_eq!(scanned.trailing_limit, None);
        assert!(!scanned.has_limit);
    }

    #[test]
    fn limit_inside_literals_is_ignored() {
        let scanned = scan("SELECT 'LIMIT 5' AS note FROM t -- LIMIT 9");
        assert_eq!(scanned.trailing_limit, None);
        assert!(!scanned.has_limit);
    }

    #[test]
    fn trailing_fetch_is_stripped_like_a_limit() {
        let scanned = scan("SELECT id FROM users FETCH FIRST 3 ROWS ONLY");
        assert!(scanned.has_limit);
        assert_eq!(scanned.body, "SELECT id FROM users");
        assert_eq!(scanned.trailing_limit, Some(LimitArg::Rows(3)));

        let scanned = scan("SELECT id FROM users ORDER BY id OFFSET 2 ROWS FETCH NEXT ROW ONLY");
        assert_eq!(scanned.body, "SELECT id FROM users ORDER BY id");
        assert_eq!(scanned.trailing_limit, Some(LimitArg::Rows(1)));

        let scanned = scan("SELECT id FROM users ORDER BY id FETCH FIRST 3 ROWS WITH TIES");
        assert!(scanned.has_limit);
        assert_eq!(scanned.trailing_limit, None);
        assert_eq!(scanned.body, "SELECT id FROM users ORDER BY id FETCH FIRST 3 ROWS WITH TIES");
    }

    #[test]
    fn markers_only_in_the_stripped_tail_are_dropped() {
        let scanned = scan("SELECT id FROM users WHERE id > $1 LIMIT $2 OFFSET $3");
        assert_eq!(scanned.body, "SELECT id FROM users WHERE id > $1");
        assert_eq!(scanned.markers, vec![1]);
        assert_eq!(scanned.retained_values(&["a", "b", "c"]), vec!["a"]);

        let scanned = scan("SELECT id FROM users WHERE id > $2 AND id < $3 OR id = $2 LIMIT $1");
        assert_eq!(
            scanned.body,
            "SELECT id FROM users WHERE id > $1 AND id < $2 OR id = $1"
        );
        assert_eq!(scanned.markers, vec![2, 3]);
        assert_eq!(scanned.retained_values(&["n", "low", "high"]), vec!["low", "high"]);
    }

    #[test]
    fn markers_without_values_are_not_invented() {
        let scanned = scan("SELECT $1::int AS one");
        assert_eq!(scanned.body, "SELECT $1::int AS one");
        assert!(scanned.retained_values::<&str>(&[]).is_empty());
    }

    #[test]
    fn wrappers_are_revalidated() {
        let count = count_query("SELECT id FROM users -- note").expect("count");
        assert_eq!(
            count.as_str(),
            "SELECT COUNT(*) FROM (\nSELECT id FROM users -- note\n) AS count_query"
        );
        let page = page_query("SELECT id FROM users", 2, 2).expect("page");
        assert_eq!(page.as_str(), "SELECT id FROM users\nLIMIT 2 OFFSET 2");
        let capped = capped_query("SELECT id FROM users", 100).expect("capped");
        assert_eq!(capped.as_str(), "SELECT id FROM users\nLIMIT 100");
    }
}
