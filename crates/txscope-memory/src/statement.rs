//! Statement parsing for the in-memory driver.
//!
//! This is not a SQL parser; it recognizes the statement shapes the session
//! layer emits and rejects everything else with a syntax error.

use txscope_core::error::{Error, QueryErrorKind, Result};

/// One recognized statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    Begin,
    Commit,
    Rollback,
    SetTransaction,
    Insert {
        table: String,
        /// Insert columns paired with the zero-based parameter index each
        /// one binds to.
        columns: Vec<(String, usize)>,
    },
    Update {
        table: String,
        /// Assignments paired with the zero-based parameter index each one
        /// binds to.
        assignments: Vec<(String, usize)>,
        predicate: Option<Predicate>,
    },
    Delete {
        table: String,
        predicate: Option<Predicate>,
    },
    Select {
        table: String,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    },
}

/// `"column" = $n` rendered as (column, zero-based parameter index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Predicate {
    pub column: String,
    pub param: usize,
}

pub(crate) fn parse(sql: &str) -> Result<Statement> {
    let sql = sql.trim().trim_end_matches(';').trim();
    let upper = sql.to_ascii_uppercase();

    if upper == "BEGIN" || upper.starts_with("BEGIN ") {
        return Ok(Statement::Begin);
    }
    if upper == "COMMIT" {
        return Ok(Statement::Commit);
    }
    if upper == "ROLLBACK" {
        return Ok(Statement::Rollback);
    }
    if upper.starts_with("SET TRANSACTION") {
        return Ok(Statement::SetTransaction);
    }
    if upper.starts_with("INSERT INTO ") {
        return parse_insert(sql);
    }
    if upper.starts_with("UPDATE ") {
        return parse_update(sql);
    }
    if upper.starts_with("DELETE FROM ") {
        return parse_delete(sql);
    }
    if upper.starts_with("SELECT * FROM ") {
        return parse_select(sql);
    }

    Err(syntax_error(sql, "unsupported statement"))
}

fn syntax_error(sql: &str, detail: &str) -> Error {
    Error::query(QueryErrorKind::Syntax, format!("{detail}: {sql:?}"))
}

/// Read one identifier (bare or double-quoted) from the front of `input`,
/// returning it together with the rest of the string.
fn read_ident(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    if let Some(rest) = input.strip_prefix('"') {
        let mut ident = String::new();
        let mut chars = rest.char_indices();
        while let Some((i, c)) = chars.next() {
            if c == '"' {
                // A doubled quote is an escaped quote; anything else ends
                // the identifier.
                if rest[i + 1..].starts_with('"') {
                    ident.push('"');
                    chars.next();
                } else {
                    return Some((ident, &rest[i + 1..]));
                }
            } else {
                ident.push(c);
            }
        }
        None
    } else {
        let end = input
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(input.len());
        if end == 0 {
            return None;
        }
        Some((input[..end].to_string(), &input[end..]))
    }
}

/// Read a `$n` placeholder, returning its zero-based index and the rest.
fn read_placeholder(input: &str) -> Option<(usize, &str)> {
    let input = input.trim_start();
    let rest = input.strip_prefix('$')?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let index: usize = rest[..end].parse().ok()?;
    if index == 0 {
        return None;
    }
    Some((index - 1, &rest[end..]))
}

/// Read the parenthesized list starting at the front of `input`.
fn read_paren_group(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    let rest = input.strip_prefix('(')?;
    let close = rest.find(')')?;
    Some((&rest[..close], &rest[close + 1..]))
}

fn parse_insert(sql: &str) -> Result<Statement> {
    let rest = &sql["INSERT INTO ".len()..];
    let (table, rest) =
        read_ident(rest).ok_or_else(|| syntax_error(sql, "INSERT missing table name"))?;

    let (column_list, rest) =
        read_paren_group(rest).ok_or_else(|| syntax_error(sql, "INSERT missing column list"))?;
    let mut columns = Vec::new();
    for piece in column_list.split(',') {
        let (name, leftover) =
            read_ident(piece).ok_or_else(|| syntax_error(sql, "bad column name"))?;
        if !leftover.trim().is_empty() {
            return Err(syntax_error(sql, "bad column name"));
        }
        columns.push(name);
    }

    let rest = rest.trim_start();
    let upper = rest.to_ascii_uppercase();
    if !upper.starts_with("VALUES") {
        return Err(syntax_error(sql, "INSERT missing VALUES"));
    }
    let (value_list, rest) = read_paren_group(&rest["VALUES".len()..])
        .ok_or_else(|| syntax_error(sql, "INSERT missing value list"))?;
    if !rest.trim().is_empty() {
        return Err(syntax_error(sql, "trailing tokens after VALUES"));
    }

    let mut params = Vec::new();
    for piece in value_list.split(',') {
        let (index, leftover) =
            read_placeholder(piece).ok_or_else(|| syntax_error(sql, "values must be $n placeholders"))?;
        if !leftover.trim().is_empty() {
            return Err(syntax_error(sql, "values must be $n placeholders"));
        }
        params.push(index);
    }

    if params.len() != columns.len() {
        return Err(syntax_error(sql, "column/value count mismatch"));
    }

    Ok(Statement::Insert {
        table,
        columns: columns.into_iter().zip(params).collect(),
    })
}

fn parse_predicate<'a>(sql: &str, rest: &'a str) -> Result<(Option<Predicate>, &'a str)> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return Ok((None, trimmed));
    }
    let upper = trimmed.to_ascii_uppercase();
    if !upper.starts_with("WHERE ") {
        return Ok((None, trimmed));
    }

    let after = &trimmed["WHERE ".len()..];
    let (column, after) =
        read_ident(after).ok_or_else(|| syntax_error(sql, "WHERE missing column"))?;
    let after = after.trim_start();
    let after = after
        .strip_prefix('=')
        .ok_or_else(|| syntax_error(sql, "WHERE supports only equality"))?;
    let (param, after) =
        read_placeholder(after).ok_or_else(|| syntax_error(sql, "WHERE value must be a $n placeholder"))?;

    Ok((Some(Predicate { column, param }), after))
}

fn parse_update(sql: &str) -> Result<Statement> {
    let rest = &sql["UPDATE ".len()..];
    let (table, rest) =
        read_ident(rest).ok_or_else(|| syntax_error(sql, "UPDATE missing table name"))?;

    let rest = rest.trim_start();
    let upper = rest.to_ascii_uppercase();
    let rest = if upper.starts_with("SET ") {
        &rest["SET ".len()..]
    } else {
        return Err(syntax_error(sql, "UPDATE missing SET"));
    };

    // Assignments run up to WHERE (or the end of the statement).
    let upper_rest = rest.to_ascii_uppercase();
    let (assign_part, where_part) = match upper_rest.find(" WHERE ") {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };

    let mut assignments = Vec::new();
    for piece in assign_part.split(',') {
        let (column, leftover) =
            read_ident(piece).ok_or_else(|| syntax_error(sql, "bad assignment column"))?;
        let leftover = leftover.trim_start();
        let leftover = leftover
            .strip_prefix('=')
            .ok_or_else(|| syntax_error(sql, "assignment missing ="))?;
        let (param, leftover) = read_placeholder(leftover)
            .ok_or_else(|| syntax_error(sql, "assignment value must be a $n placeholder"))?;
        if !leftover.trim().is_empty() {
            return Err(syntax_error(sql, "bad assignment"));
        }
        assignments.push((column, param));
    }
    if assignments.is_empty() {
        return Err(syntax_error(sql, "UPDATE with no assignments"));
    }

    let (predicate, rest) = parse_predicate(sql, where_part)?;
    if !rest.trim().is_empty() {
        return Err(syntax_error(sql, "trailing tokens after UPDATE"));
    }

    Ok(Statement::Update {
        table,
        assignments,
        predicate,
    })
}

fn parse_delete(sql: &str) -> Result<Statement> {
    let rest = &sql["DELETE FROM ".len()..];
    let (table, rest) =
        read_ident(rest).ok_or_else(|| syntax_error(sql, "DELETE missing table name"))?;
    let (predicate, rest) = parse_predicate(sql, rest)?;
    if !rest.trim().is_empty() {
        return Err(syntax_error(sql, "trailing tokens after DELETE"));
    }
    Ok(Statement::Delete { table, predicate })
}

fn parse_select(sql: &str) -> Result<Statement> {
    let rest = &sql["SELECT * FROM ".len()..];
    let (table, rest) =
        read_ident(rest).ok_or_else(|| syntax_error(sql, "SELECT missing table name"))?;
    let (predicate, rest) = parse_predicate(sql, rest)?;

    let rest = rest.trim();
    let limit = if rest.is_empty() {
        None
    } else {
        let upper = rest.to_ascii_uppercase();
        let count = upper
            .strip_prefix("LIMIT ")
            .and_then(|n| n.trim().parse::<usize>().ok())
            .ok_or_else(|| syntax_error(sql, "trailing tokens after SELECT"))?;
        Some(count)
    };

    Ok(Statement::Select {
        table,
        predicate,
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transaction_control() {
        assert_eq!(parse("BEGIN").expect("parse"), Statement::Begin);
        assert_eq!(parse("commit;").expect("parse"), Statement::Commit);
        assert_eq!(parse(" ROLLBACK ").expect("parse"), Statement::Rollback);
        assert_eq!(
            parse("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").expect("parse"),
            Statement::SetTransaction
        );
    }

    #[test]
    fn parses_insert_with_quoted_columns() {
        let stmt = parse("INSERT INTO \"example\" (\"id\", \"name\") VALUES ($1, $2)")
            .expect("parse");
        assert_eq!(
            stmt,
            Statement::Insert {
                table: "example".into(),
                columns: vec![("id".into(), 0), ("name".into(), 1)],
            }
        );
    }

    #[test]
    fn parses_select_with_predicate_and_limit() {
        let stmt = parse("SELECT * FROM \"example\" WHERE \"id\" = $1 LIMIT 1").expect("parse");
        assert_eq!(
            stmt,
            Statement::Select {
                table: "example".into(),
                predicate: Some(Predicate {
                    column: "id".into(),
                    param: 0,
                }),
                limit: Some(1),
            }
        );
    }

    #[test]
    fn parses_bare_select_and_delete() {
        assert_eq!(
            parse("SELECT * FROM example").expect("parse"),
            Statement::Select {
                table: "example".into(),
                predicate: None,
                limit: None,
            }
        );
        assert_eq!(
            parse("DELETE FROM \"example\" WHERE \"id\" = $1").expect("parse"),
            Statement::Delete {
                table: "example".into(),
                predicate: Some(Predicate {
                    column: "id".into(),
                    param: 0,
                }),
            }
        );
    }

    #[test]
    fn parses_update_with_assignments() {
        let stmt = parse("UPDATE \"note\" SET \"is_deleted\" = $1, \"deleted_at\" = $2 WHERE \"id\" = $3")
            .expect("parse");
        assert_eq!(
            stmt,
            Statement::Update {
                table: "note".into(),
                assignments: vec![("is_deleted".into(), 0), ("deleted_at".into(), 1)],
                predicate: Some(Predicate {
                    column: "id".into(),
                    param: 2,
                }),
            }
        );
    }

    #[test]
    fn rejects_unsupported_statements() {
        assert!(parse("SELECT id FROM example").is_err());
        assert!(parse("INSERT INTO example (a) VALUES (1)").is_err());
        assert!(parse("DELETE FROM example WHERE id > $1").is_err());
        assert!(parse("UPDATE example SET x = 1").is_err());
        assert!(parse("TRUNCATE example").is_err());
    }

    #[test]
    fn rejects_count_mismatch() {
        assert!(parse("INSERT INTO t (\"a\", \"b\") VALUES ($1)").is_err());
    }
}
