//! SQL issued by ch-scope, and client-side argument binding.
//!
//! The statement texts are matched literally by the engine's query log and
//! by the correlator's self-check exclusion, so they must not be reformatted.

use crate::error::{Result, ScopeError};

/// Text of the handshake query issued when a session is opened.
///
/// The query log probe excludes entries with exactly this text.
pub const SELF_CHECK_PROBE_TEXT: &str = "SELECT displayName(), version(), revision(), timezone()";

pub const SHOW_DATABASES: &str = "SHOW DATABASES";

pub const LIST_TABLES: &str = "SELECT name, engine FROM system.tables WHERE database = ?";

pub const LIST_COLUMNS: &str = "SELECT name, type FROM system.columns WHERE table = ? AND database = ?";

pub const SERVER_VERSION: &str = "SELECT version()";

pub const FLUSH_LOGS: &str = "SYSTEM FLUSH LOGS";

/// Looks up the finished-query log entry for one query id.
pub const QUERY_LOG_PROBE: &str = "SELECT query_duration_ms, read_rows, read_bytes, memory_usage, \
ProfileEvents['SelectedParts'], ProfileEvents['SelectedMarks'] FROM system.query_log \
WHERE type = 'QueryFinish' AND query_id = ? \
AND query != 'SELECT displayName(), version(), revision(), timezone()' LIMIT 1";

/// Builds `SHOW CREATE TABLE` for a database-qualified table.
pub fn show_create_table(database: &str, table: &str) -> String {
    format!(
        "SHOW CREATE TABLE {}.{}",
        quote_identifier(database),
        quote_identifier(table)
    )
}

/// Wraps an identifier in backticks, escaping embedded backticks and backslashes.
pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
    format!("`{escaped}`")
}

/// Quotes a string literal, escaping quotes and backslashes.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Replaces each `?` placeholder with the next argument as a string literal.
///
/// Placeholders inside quoted literals, backtick identifiers and
/// double-quoted identifiers are left alone.
pub fn bind_args(sql: &str, args: &[&str]) -> Result<String> {
    let mut bound = String::with_capacity(sql.len() + args.iter().map(|a| a.len() + 2).sum::<usize>());
    let mut remaining = args.iter();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in sql.chars() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '`' | '"') => quote = Some(c),
            None if c == '?' => {
                let arg = remaining.next().ok_or_else(|| {
                    ScopeError::query(format!(
                        "Statement has more placeholders than the {} argument(s) given",
                        args.len()
                    ))
                })?;
                bound.push_str(&quote_literal(arg));
                continue;
            }
            None => {}
        }
        bound.push(c);
    }

    if remaining.next().is_some() {
        return Err(ScopeError::query(format!(
            "Statement has fewer placeholders than the {} argument(s) given",
            args.len()
        )));
    }
    Ok(bound)
}
