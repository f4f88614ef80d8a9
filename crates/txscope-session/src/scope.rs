//! Scoped transaction execution.
//!
//! [`SessionScope::with_transaction`] is the one place a session is born and
//! buried: acquire a connection, open a transaction, bind the session to the
//! request context, run the caller's work, then finalize — commit on success,
//! roll back on any failure (including cancellation), and in every case
//! return the connection and unbind the context.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use asupersync::{Cx, Outcome};
use txscope_core::error::{Error, SessionErrorKind};
use txscope_core::{Connection, IsolationLevel};
use txscope_pool::Pool;

use crate::context::RequestContext;
use crate::{Session, TxState};

/// Behavior knobs for a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeConfig {
    /// Raise the isolation level of every transaction opened by this scope.
    pub isolation: Option<IsolationLevel>,
}

/// Lifetime counters for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeStats {
    /// Transactions that committed.
    pub committed: u64,
    /// Transactions that rolled back cleanly.
    pub rolled_back: u64,
    /// Rollbacks that themselves failed (connection retired each time).
    pub rollback_failures: u64,
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    rolled_back: AtomicU64,
    rollback_failures: AtomicU64,
}

/// Runs units of work inside request-scoped transactions.
///
/// Cheap to share: the pool inside is reference counted, and the scope itself
/// carries only configuration and counters.
pub struct SessionScope<C: Connection> {
    pool: Pool<C>,
    config: ScopeConfig,
    counters: Counters,
}

impl<C: Connection> SessionScope<C> {
    /// A scope over the given pool with default configuration.
    pub fn new(pool: Pool<C>) -> Self {
        Self::with_config(pool, ScopeConfig::default())
    }

    /// A scope over the given pool with explicit configuration.
    pub fn with_config(pool: Pool<C>, config: ScopeConfig) -> Self {
        Self {
            pool,
            config,
            counters: Counters::default(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// The scope's configuration.
    pub fn config(&self) -> ScopeConfig {
        self.config
    }

    /// A snapshot of the scope's lifetime counters.
    pub fn stats(&self) -> ScopeStats {
        ScopeStats {
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            rollback_failures: self.counters.rollback_failures.load(Ordering::Relaxed),
        }
    }

    /// Run `work` inside a transaction bound to `ctx`.
    ///
    /// `factory` establishes fresh connections when the pool grows; it is the
    /// same signature [`Pool::acquire`] takes. `work` receives the session
    /// exclusively for the duration of the call.
    ///
    /// Exit behavior:
    ///
    /// - `work` returns `Ok` → `COMMIT`, release, unbind, return the value.
    /// - `work` fails, is cancelled, or panics through → `ROLLBACK`, release,
    ///   unbind, propagate the original outcome unchanged.
    /// - `COMMIT` fails → `ROLLBACK`, release, unbind, propagate the commit
    ///   error.
    /// - `ROLLBACK` fails while cleaning up → the failure is logged and
    ///   counted, the connection is retired instead of pooled, and the
    ///   primary failure still propagates.
    ///
    /// Calling this while `ctx` already has a bound session fails fast with
    /// [`SessionErrorKind::AlreadyBound`]; nested scopes are not supported.
    #[tracing::instrument(level = "debug", skip_all, fields(request = %ctx.request_id()))]
    pub async fn with_transaction<T, Fac, FacFut, W>(
        &self,
        cx: &Cx,
        ctx: &mut RequestContext,
        factory: Fac,
        work: W,
    ) -> Outcome<T, Error>
    where
        Fac: Fn() -> FacFut,
        FacFut: Future<Output = Outcome<C, Error>>,
        W: AsyncFnOnce(&mut Session<C>) -> Outcome<T, Error>,
    {
        if ctx.has_session() {
            return Outcome::Err(Error::session(
                SessionErrorKind::AlreadyBound,
                format!(
                    "request {} already has an open transaction scope; nested scopes are not supported",
                    ctx.request_id()
                ),
            ));
        }

        // Acquisition failure: no session is created, nothing to finalize.
        let conn = match self.pool.acquire(cx, factory).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut session = Session::new(ctx.request_id().clone(), conn);
        let session_id = session.id();

        match session.begin_with(cx, self.config.isolation).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                self.abort_begin(cx, session).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort_begin(cx, session).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort_begin(cx, session).await;
                return Outcome::Panicked(p);
            }
        }

        if let Err(e) = ctx.bind(session_id) {
            self.rollback_and_close(cx, session).await;
            return Outcome::Err(e);
        }

        tracing::debug!(session = %session_id, "transaction scope opened");

        let outcome = work(&mut session).await;

        let result = match outcome {
            Outcome::Ok(value) => match session.commit(cx).await {
                Outcome::Ok(()) => {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                    session.finish();
                    Outcome::Ok(value)
                }
                // Commit rejection is a failure exit: the session rolls back
                // and the commit error is what the caller sees.
                Outcome::Err(commit_err) => {
                    self.rollback_and_close(cx, session).await;
                    Outcome::Err(commit_err)
                }
                Outcome::Cancelled(r) => {
                    self.rollback_and_close(cx, session).await;
                    Outcome::Cancelled(r)
                }
                Outcome::Panicked(p) => {
                    self.rollback_and_close(cx, session).await;
                    Outcome::Panicked(p)
                }
            },
            Outcome::Err(work_err) => {
                self.rollback_and_close(cx, session).await;
                Outcome::Err(work_err)
            }
            Outcome::Cancelled(r) => {
                self.rollback_and_close(cx, session).await;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.rollback_and_close(cx, session).await;
                Outcome::Panicked(p)
            }
        };

        ctx.unbind(session_id);
        result
    }

    /// Tear down a session whose `BEGIN` never completed cleanly.
    ///
    /// If the transaction did open (the failure came from the isolation
    /// statement), it gets the normal rollback-and-release path; a session
    /// that never reached `Active` retires its connection instead, since the
    /// connection's state is not trustworthy after a failed `BEGIN`.
    async fn abort_begin(&self, cx: &Cx, session: Session<C>) {
        if session.state() == TxState::Active {
            self.rollback_and_close(cx, session).await;
        } else {
            session.discard();
        }
    }

    /// Roll back and finalize after a failure.
    ///
    /// The caller's primary failure always propagates; a rollback failure is
    /// the secondary signal, reported through the log and the
    /// `rollback_failures` counter, and the connection is retired rather than
    /// returned to the idle set in an unknown transaction state.
    async fn rollback_and_close(&self, cx: &Cx, mut session: Session<C>) {
        let session_id = session.id();
        match session.rollback(cx).await {
            Outcome::Ok(()) => {
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                session.finish();
            }
            Outcome::Err(secondary) => {
                self.counters.rollback_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    session = %session_id,
                    error = %secondary,
                    "rollback failed during cleanup; retiring connection"
                );
                session.discard();
            }
            Outcome::Cancelled(reason) => {
                self.counters.rollback_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    session = %session_id,
                    reason = ?reason,
                    "rollback cancelled during cleanup; retiring connection"
                );
                session.discard();
            }
            Outcome::Panicked(payload) => {
                self.counters.rollback_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    session = %session_id,
                    payload = ?payload,
                    "rollback panicked during cleanup; retiring connection"
                );
                session.discard();
            }
        }
    }
}

impl<C: Connection> std::fmt::Debug for SessionScope<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScope")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
