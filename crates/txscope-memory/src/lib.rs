//! In-memory database driver for txscope.
//!
//! [`MemDb`] is a shared committed store; [`MemConnection`] implements the
//! [`Connection`] trait over it with real transaction visibility: a
//! connection sees its own uncommitted writes, other connections see only
//! what has been committed. That is exactly enough to observe
//! commit-on-success and rollback-on-failure from the outside, which is what
//! the session layer's tests need.
//!
//! The driver understands the statement shapes the session layer emits —
//! `BEGIN` / `COMMIT` / `ROLLBACK` / `SET TRANSACTION …`, single-table
//! `INSERT` / `SELECT *` / `DELETE` with an optional single equality
//! predicate — and maps anything else to a syntax error, the way a real
//! driver surfaces an unparseable statement.
//!
//! # Example
//!
//! ```ignore
//! let db = MemDb::new();
//! db.create_table("example", &["id", "name"]);
//!
//! let conn = db.connect();
//! conn.execute(&cx, "BEGIN", &[]).await?;
//! conn.insert(&cx, "INSERT INTO \"example\" (\"name\") VALUES ($1)",
//!             &[Value::Text("first".into())]).await?;
//! conn.execute(&cx, "COMMIT", &[]).await?;
//! ```

mod connection;
mod statement;

pub use connection::{MemConnection, MemDb};
