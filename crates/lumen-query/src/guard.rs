//! Read-only statement validation.
//!
//! Two layers run on every statement. The lexical layer walks the token
//! stream and rejects statement separators, write/DDL keywords, procedural
//! escape hatches and side-effecting functions wherever they appear outside
//! literals. The structural layer parses the statement with sqlparser and
//! requires a single query with no `SELECT ... INTO` and no row locks.
//!
//! Both layers are conservative: anything they cannot classify is rejected.

use std::fmt;

use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::lexer::{LexError, Token, TokenKind, tokenize};

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "ALTER", "CREATE", "TRUNCATE",
    "GRANT", "REVOKE", "COPY", "CALL", "DO", "EXEC", "EXECUTE", "PREPARE", "DEALLOCATE", "VACUUM",
    "REINDEX", "CLUSTER", "LISTEN", "NOTIFY", "UNLISTEN", "REFRESH", "IMPORT", "INTO",
];

const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "lo_import",
    "lo_export",
    "lo_unlink",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "pg_rotate_logfile",
    "set_config",
    "nextval",
    "setval",
];

const FORBIDDEN_FUNCTION_PREFIXES: &[&str] = &["dblink", "pg_advisory_lock", "pg_sleep", "query_to_xml"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("query is empty")]
    Empty,
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    #[error("`{0}` is not allowed in a read-only query")]
    ForbiddenKeyword(String),
    #[error("function `{0}` is not allowed")]
    ForbiddenFunction(String),
    #[error("placeholder `${{{0}}}` has no bound value")]
    UnboundPlaceholder(String),
    #[error("positional parameter `{0}` is not allowed in a template, use ${{name}} placeholders")]
    PositionalInTemplate(String),
    #[error("only SELECT queries are allowed")]
    NotAQuery,
    #[error("SELECT ... INTO is not allowed")]
    SelectInto,
    #[error("row locking clauses are not allowed")]
    LockingClause,
    #[error("SQL could not be parsed: {0}")]
    Syntax(String),
}

/// A single read-only statement that passed [`assert_safe_select`]. Any
/// trailing `;` has been removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    text: String,
}

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A template that passed [`assert_safe_template`], with its distinct
/// placeholder names in first-occurrence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTemplate {
    text: String,
    placeholders: Vec<String>,
}

impl ValidatedTemplate {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Raw,
    Template,
}

/// Accepts exactly one read-only query. Positional markers (`$1`) are
/// allowed; `${name}` placeholders are not.
pub fn assert_safe_select(sql: &str) -> Result<ValidatedSql, GuardError> {
    let text = statement_text(sql)?;
    let tokens = tokenize(text)?;
    check_tokens(&tokens, Mode::Raw)?;
    check_structure(text)?;
    Ok(ValidatedSql {
        text: text.to_string(),
    })
}

/// Accepts a read-only query containing `${name}` placeholders in value
/// positions. Positional markers are rejected so every parameter has a name.
pub fn assert_safe_template(template: &str) -> Result<ValidatedTemplate, GuardError> {
    let text = statement_text(template)?;
    let tokens = tokenize(text)?;
    let placeholders = check_tokens(&tokens, Mode::Template)?;
    let parseable = rewrite_placeholders(text, &tokens, |name| {
        placeholders
            .iter()
            .position(|known| known == name)
            .map(|idx| format!("${}", idx + 1))
    });
    check_structure(&parseable)?;
    Ok(ValidatedTemplate {
        text: text.to_string(),
        placeholders,
    })
}

/// Replaces each placeholder token for which `replacement` returns a value.
/// Others are left as written.
pub(crate) fn rewrite_placeholders<F>(text: &str, tokens: &[Token<'_>], replacement: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for token in tokens {
        let Some(name) = token.placeholder_name() else {
            continue;
        };
        if let Some(marker) = replacement(name) {
            out.push_str(&text[copied..token.span.start]);
            out.push_str(&marker);
            copied = token.span.end;
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// The statement without surrounding whitespace or its one permitted
/// trailing semicolon.
fn statement_text(sql: &str) -> Result<&str, GuardError> {
    let tokens = tokenize(sql)?;
    let end = match tokens.iter().position(|token| token.kind == TokenKind::Semicolon) {
        None => sql.len(),
        Some(idx) if idx + 1 == tokens.len() => tokens[idx].span.start,
        Some(_) => return Err(GuardError::MultipleStatements),
    };
    let text = sql[..end].trim();
    if text.is_empty() || tokens.is_empty() {
        return Err(GuardError::Empty);
    }
    Ok(text)
}

fn check_tokens(tokens: &[Token<'_>], mode: Mode) -> Result<Vec<String>, GuardError> {
    if tokens.is_empty() {
        return Err(GuardError::Empty);
    }
    let mut placeholders: Vec<String> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Word => {
                let upper = token.text.to_ascii_uppercase();
                if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                    return Err(GuardError::ForbiddenKeyword(upper));
                }
            }
            TokenKind::Placeholder => {
                let name = token.placeholder_name().unwrap_or_default();
                if mode == Mode::Raw {
                    return Err(GuardError::UnboundPlaceholder(name.to_string()));
                }
                if !placeholders.iter().any(|known| known == name) {
                    placeholders.push(name.to_string());
                }
            }
            TokenKind::Positional if mode == Mode::Template => {
                return Err(GuardError::PositionalInTemplate(token.text.to_string()));
            }
            _ => {}
        }

        let is_call = tokens
            .get(idx + 1)
            .is_some_and(|next| next.kind == TokenKind::LParen);
        if is_call {
            if let Some(name) = token.identifier() {
                if is_forbidden_function(&name) {
                    return Err(GuardError::ForbiddenFunction(name));
                }
            }
        }
    }
    Ok(placeholders)
}

fn is_forbidden_function(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    FORBIDDEN_FUNCTIONS.contains(&name.as_str())
        || FORBIDDEN_FUNCTION_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

fn check_structure(sql: &str) -> Result<(), GuardError> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|err| GuardError::Syntax(err.to_string()))?;
    match statements.as_slice() {
        [] => Err(GuardError::Empty),
        [Statement::Query(query)] => check_query(query),
        [_] => Err(GuardError::NotAQuery),
        _ => Err(GuardError::MultipleStatements),
    }
}

fn check_query(query: &Query) -> Result<(), GuardError> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query)?;
        }
    }
    if !query.locks.is_empty() {
        return Err(GuardError::LockingClause);
    }
    check_set_expr(&query.body)
}

fn check_set_expr(body: &SetExpr) -> Result<(), GuardError> {
    match body {
        SetExpr::Select(select) if select.into.is_some() => Err(GuardError::SelectInto),
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
        SetExpr::Query(query) => check_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left)?;
            check_set_expr(right)
        }
        _ => Err(GuardError::NotAQuery),
    }
}
