//! Per-request correlation context.
//!
//! A [`RequestContext`] scopes one [`Session`](crate::Session) to one logical
//! request. It is an explicit value the caller threads through the request
//! flow; there is no task-local lookup behind it. At most one live session is
//! bound to a context at any instant.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use txscope_core::error::{Error, SessionErrorKind};

use crate::SessionId;

static NEXT_REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Correlation identifier for one logical request.
///
/// Usually carried in from the transport (an `X-Request-ID` header value);
/// [`RequestId::generate`] covers flows that arrive without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an externally supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a process-unique identifier for requests that arrived without
    /// one.
    pub fn generate() -> Self {
        Self(format!("req-{:08x}", NEXT_REQUEST_SEQ.fetch_add(1, Ordering::Relaxed)))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Correlation handle binding at most one session to one request flow.
///
/// Created when request processing begins and dropped when it finishes;
/// [`SessionScope::with_transaction`](crate::SessionScope::with_transaction)
/// binds and unbinds the session on the way through.
#[derive(Debug)]
pub struct RequestContext {
    id: RequestId,
    bound: Option<SessionId>,
}

impl RequestContext {
    /// A context for the given request.
    pub fn new(id: RequestId) -> Self {
        Self { id, bound: None }
    }

    /// The request this context belongs to.
    pub fn request_id(&self) -> &RequestId {
        &self.id
    }

    /// Whether a session is currently bound.
    pub fn has_session(&self) -> bool {
        self.bound.is_some()
    }

    /// The session bound to this request.
    ///
    /// Fails with [`SessionErrorKind::NoActiveSession`] outside an active
    /// transaction scope — a programming error in the request handler, not a
    /// runtime condition to recover from.
    pub fn current_session(&self) -> Result<SessionId, Error> {
        self.bound.ok_or_else(|| {
            Error::session(
                SessionErrorKind::NoActiveSession,
                format!("request {} has no active session", self.id),
            )
        })
    }

    pub(crate) fn bind(&mut self, session: SessionId) -> Result<(), Error> {
        if let Some(existing) = self.bound {
            return Err(Error::session(
                SessionErrorKind::AlreadyBound,
                format!(
                    "request {} is already bound to {existing}; nested transaction scopes are not supported",
                    self.id
                ),
            ));
        }
        self.bound = Some(session);
        Ok(())
    }

    pub(crate) fn unbind(&mut self, session: SessionId) {
        match self.bound {
            Some(bound) if bound == session => self.bound = None,
            Some(bound) => {
                tracing::warn!(
                    request = %self.id,
                    bound = %bound,
                    unbinding = %session,
                    "unbind for a session that is not the bound one"
                );
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_ids() -> (SessionId, SessionId) {
        // SessionId construction is private to the crate; route through the
        // allocator used by real sessions.
        (SessionId::next(), SessionId::next())
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn current_session_outside_scope_is_a_misuse_error() {
        let ctx = RequestContext::new(RequestId::new("req-1"));
        let err = ctx.current_session().expect_err("no session bound");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::NoActiveSession));
    }

    #[test]
    fn bind_unbind_roundtrip() {
        let (first, _) = session_ids();
        let mut ctx = RequestContext::new(RequestId::new("req-2"));
        ctx.bind(first).expect("bind");
        assert_eq!(ctx.current_session().expect("bound"), first);

        ctx.unbind(first);
        assert!(!ctx.has_session());
        assert!(ctx.current_session().is_err());
    }

    #[test]
    fn second_bind_is_rejected() {
        let (first, second) = session_ids();
        let mut ctx = RequestContext::new(RequestId::new("req-3"));
        ctx.bind(first).expect("bind");

        let err = ctx.bind(second).expect_err("double bind");
        assert_eq!(err.session_kind(), Some(SessionErrorKind::AlreadyBound));
        // The original binding is untouched.
        assert_eq!(ctx.current_session().expect("bound"), first);
    }

    #[test]
    fn unbind_of_unrelated_session_keeps_binding() {
        let (first, second) = session_ids();
        let mut ctx = RequestContext::new(RequestId::new("req-4"));
        ctx.bind(first).expect("bind");
        ctx.unbind(second);
        assert_eq!(ctx.current_session().expect("still bound"), first);
    }
}
