//! SQL identifier validation and quoting.
//!
//! Table and column names flow into statement text (they cannot be bound as
//! parameters), so anything that reaches SQL through `Model` metadata is
//! validated and double-quoted here.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, QueryErrorKind, Result};

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid pattern"))
}

/// True when `name` is a plain identifier: starts with a letter or
/// underscore, continues with letters, digits, or underscores, and fits in
/// 63 bytes.
pub fn is_safe_identifier(name: &str) -> bool {
    ident_pattern().is_match(name)
}

/// Validate `name` as a plain identifier, mapping failures to a syntax error.
pub fn check_identifier(name: &str) -> Result<()> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(Error::query(
            QueryErrorKind::Syntax,
            format!("invalid SQL identifier: {name:?}"),
        ))
    }
}

/// Double-quote an identifier for inclusion in statement text.
///
/// Callers are expected to have validated the name first; embedded quotes are
/// doubled anyway so the output is always well-formed.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_safe_identifier("example"));
        assert!(is_safe_identifier("_private"));
        assert!(is_safe_identifier("table_2"));
    }

    #[test]
    fn rejects_hostile_identifiers() {
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("2fast"));
        assert!(!is_safe_identifier("users; DROP TABLE users"));
        assert!(!is_safe_identifier("name\"with\"quotes"));
        assert!(!is_safe_identifier(&"x".repeat(64)));
    }

    #[test]
    fn check_identifier_maps_to_syntax_error() {
        assert!(check_identifier("ok").is_ok());
        let err = check_identifier("no way").expect_err("rejected");
        match err {
            Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::Syntax),
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("example"), "\"example\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
