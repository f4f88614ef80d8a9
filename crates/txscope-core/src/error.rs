//! Error taxonomy for txscope.
//!
//! Errors are grouped by the layer that produces them:
//!
//! - [`ConnectionError`] — establishing or keeping a driver connection alive
//! - [`QueryError`] — a statement the database rejected or failed to run
//! - [`PoolError`] — connection pool hand-out problems
//! - [`SessionError`] — session state machine and request-context misuse
//!
//! Every variant carries a kind enum so callers can branch without string
//! matching, plus a human-readable message. Secondary failures (a rollback
//! that fails while cleaning up after a primary failure) are reported through
//! tracing and scope statistics; the primary error is what propagates.

use std::fmt;

/// Convenience alias for fallible synchronous operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for all txscope operations.
#[derive(Debug)]
pub enum Error {
    /// Connection establishment or liveness failure.
    Connection(ConnectionError),
    /// Statement execution failure.
    Query(QueryError),
    /// Connection pool failure.
    Pool(PoolError),
    /// Session state machine or request-context misuse.
    Session(SessionError),
    /// Operation exceeded its time allowance.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::Query(e) => write!(f, "query error: {e}"),
            Self::Pool(e) => write!(f, "pool error: {e}"),
            Self::Session(e) => write!(f, "session error: {e}"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = match self {
            Self::Connection(e) => e.source.as_ref(),
            Self::Query(e) => e.source.as_ref(),
            Self::Pool(_) | Self::Session(_) | Self::Timeout => None,
        };
        source.map(|boxed| {
            let err: &(dyn std::error::Error + 'static) = boxed.as_ref();
            err
        })
    }
}

// ============================================================================
// Connection errors
// ============================================================================

/// What went wrong while establishing or using a driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Could not reach or negotiate with the server.
    Connect,
    /// The server actively refused the connection.
    Refused,
    /// Credentials were missing or rejected.
    Authentication,
    /// The connection dropped mid-operation.
    Disconnected,
}

/// A failure at the connection layer.
#[derive(Debug)]
pub struct ConnectionError {
    /// Classification of the failure.
    pub kind: ConnectionErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause, when one exists.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Query errors
// ============================================================================

/// Classification of a statement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// The statement could not be parsed.
    Syntax,
    /// A constraint was violated (possibly detected at commit time).
    Constraint,
    /// Serialization failure under concurrent transactions.
    Serialization,
    /// The database detected a deadlock.
    Deadlock,
    /// The statement was cancelled server-side.
    Cancelled,
    /// The statement timed out server-side.
    Timeout,
    /// Any other database-reported failure.
    Database,
}

/// A failure reported for a specific statement.
#[derive(Debug)]
pub struct QueryError {
    /// Classification of the failure.
    pub kind: QueryErrorKind,
    /// Human-readable description.
    pub message: String,
    /// SQLSTATE code, when the driver surfaces one.
    pub sqlstate: Option<String>,
    /// The offending SQL, when known.
    pub sql: Option<String>,
    /// Underlying cause, when one exists.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(state) = &self.sqlstate {
            write!(f, " (SQLSTATE {state})")?;
        }
        Ok(())
    }
}

// ============================================================================
// Pool errors
// ============================================================================

/// Classification of a pool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Every connection is in use and the caller asked not to wait.
    Exhausted,
    /// The pool was closed.
    Closed,
    /// The pool configuration is invalid.
    Config,
}

/// A failure while handing out or taking back pooled connections.
#[derive(Debug)]
pub struct PoolError {
    /// Classification of the failure.
    pub kind: PoolErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Session errors
// ============================================================================

/// Classification of a session or context misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// `current_session` was called outside any transaction scope.
    NoActiveSession,
    /// A transaction scope was opened while the context already had one.
    /// Nested scopes are not supported.
    AlreadyBound,
    /// A session operation was issued in a transaction state that does not
    /// permit it.
    InvalidState,
    /// The rollback issued while cleaning up after a failure itself failed.
    RollbackFailed,
}

/// A session state machine or request-context misuse.
///
/// These signal programming errors in request handlers: fatal to the request,
/// not something to retry.
#[derive(Debug)]
pub struct SessionError {
    /// Classification of the misuse.
    pub kind: SessionErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Helper constructors
// ============================================================================

impl Error {
    /// Build a connection error with no underlying source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a query error with no driver metadata.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self::Query(QueryError {
            kind,
            message: message.into(),
            sqlstate: None,
            sql: None,
            source: None,
        })
    }

    /// Build a pool error.
    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Self::Pool(PoolError {
            kind,
            message: message.into(),
        })
    }

    /// Build a session error.
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self::Session(SessionError {
            kind,
            message: message.into(),
        })
    }

    /// The session-error kind, if this is a session error.
    pub fn session_kind(&self) -> Option<SessionErrorKind> {
        match self {
            Self::Session(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::pool(PoolErrorKind::Exhausted, "all 4 connections in use");
        assert_eq!(err.to_string(), "pool error: Exhausted: all 4 connections in use");
    }

    #[test]
    fn query_display_includes_sqlstate() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            message: "duplicate key".into(),
            sqlstate: Some("23505".into()),
            sql: None,
            source: None,
        });
        let rendered = err.to_string();
        assert!(rendered.contains("Constraint"));
        assert!(rendered.contains("SQLSTATE 23505"));
    }

    #[test]
    fn session_kind_accessor() {
        let err = Error::session(SessionErrorKind::NoActiveSession, "no scope");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::NoActiveSession));
        assert_eq!(Error::Timeout.session_kind(), None);
    }

    #[test]
    fn source_chains_through_connection_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: "could not connect".into(),
            source: Some(Box::new(io)),
        });
        assert!(std::error::Error::source(&err).is_some());
    }
}
