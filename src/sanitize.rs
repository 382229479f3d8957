//! Identifier sanitisation for caller-supplied collection and schema names.
//!
//! Collection names become storage tree names inside a tenant's storage unit,
//! so every name coming from an untrusted caller goes through [`validate`]
//! before it is used, including for create and drop.

use crate::error::{DbError, DbResult};

pub const MAX_IDENTIFIER_LEN: usize = 64;

const QUOTE: char = '`';

/// Names that may never be used as an identifier, compared case-insensitively.
const RESERVED_WORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TABLE", "INDEX", "VIEW",
    "DATABASE", "SCHEMA", "WHERE", "FROM", "JOIN", "UNION", "ORDER", "GROUP", "HAVING", "LIMIT",
    "OFFSET",
];

/// Check `name` against `[A-Za-z_][A-Za-z0-9_]*`, the length cap and the
/// reserved-word denylist.
pub fn validate(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }

    if name.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(DbError::InvalidIdentifier(format!(
            "identifier too long (max {} characters)",
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::InvalidIdentifier(format!(
            "identifier '{}' must start with a letter or underscore and contain only alphanumeric characters and underscores",
            name
        )));
    }

    if RESERVED_WORDS
        .iter()
        .any(|word| word.eq_ignore_ascii_case(name))
    {
        return Err(DbError::InvalidIdentifier(format!(
            "identifier cannot be a reserved word: {}",
            name
        )));
    }

    Ok(())
}

/// Wrap `name` in backticks, doubling any embedded backtick.
pub fn quote(name: &str) -> String {
    let escaped = name.replace(QUOTE, "``");
    format!("{QUOTE}{escaped}{QUOTE}")
}

/// Validate then quote. Use this for every name headed into storage.
pub fn safe_identifier(name: &str) -> DbResult<String> {
    validate(name)?;
    Ok(quote(name))
}
