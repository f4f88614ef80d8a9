//! The driver connection contract.

use std::future::Future;

use asupersync::{Cx, Outcome};

use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;

/// Transaction isolation levels, in increasing strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// The database default (usually READ COMMITTED).
    #[default]
    ReadCommitted,
    /// Repeatable reads within the transaction.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

impl IsolationLevel {
    /// The SQL spelling used in `SET TRANSACTION ISOLATION LEVEL …`.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// One live database connection.
///
/// Implemented by driver crates. All methods take a [`Cx`] and return an
/// [`Outcome`] so cancellation propagates instead of being swallowed.
///
/// Transaction control (`BEGIN`/`COMMIT`/`ROLLBACK`) goes through [`execute`]:
/// the session layer owns the transaction state machine, so the trait does not
/// hand out a separate transaction object.
///
/// [`execute`]: Connection::execute
pub trait Connection: Send + Sync + 'static {
    /// Run a parameterized query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Run a parameterized query expected to produce at most one row.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Execute a statement and return the number of rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT and return the generated id.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Check connection liveness.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Close the connection.
    fn close(self, cx: &Cx) -> impl Future<Output = Result<()>> + Send;
}
