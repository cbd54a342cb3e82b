// ============================================================================
// Transaction Interceptor
// ============================================================================
//
// The method-boundary logic: resolves which unit of work applies to an
// invocation, begins it if not already active, dispatches to the blocking or
// reactive execution path, and applies the commit/rollback policy. Per
// invocation the state machine is
//
//   NoActiveWork -> WorkBegun -> TransactionActive -> Committing|RollingBack -> WorkEnded
//
// with two standing rules: a transaction found already active on entry means
// the invocation joins it and never independently ends it, and a unit of work
// is ended only by the invocation that began it.

pub mod policy;

use crate::context::{CallContext, ContextSnapshot, STARTED_ON_THIS_THREAD};
use crate::core::{PersistError, Result};
use crate::work::UnitOfWork;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use policy::{Fault, FaultKind, RollbackPolicy, TxOutcome};

/// Failure of a transactional invocation: either the wrapped work's own error
/// (propagated unchanged after the commit/rollback decision was executed) or
/// a coordination failure from the persistence layer itself.
#[derive(Debug, Error)]
pub enum TxError<E: std::error::Error> {
    #[error(transparent)]
    Work(E),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl<E: std::error::Error> TxError<E> {
    /// The wrapped work error, if this was a work failure.
    pub fn into_work(self) -> Option<E> {
        match self {
            TxError::Work(e) => Some(e),
            TxError::Persist(_) => None,
        }
    }
}

/// Per-invocation metadata: the persistence-unit override and the declared
/// rollback policies. Resolution order for the policy is method level, then
/// type level, then the interceptor's process-wide default.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    unit: Option<String>,
    method_policy: Option<RollbackPolicy>,
    type_policy: Option<RollbackPolicy>,
}

impl CallMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route this invocation to a named persistence unit instead of the
    /// default one.
    pub fn unit(mut self, name: &str) -> Self {
        self.unit = Some(name.to_string());
        self
    }

    /// Declare a method-level rollback policy.
    pub fn method_policy(mut self, policy: RollbackPolicy) -> Self {
        self.method_policy = Some(policy);
        self
    }

    /// Declare a type-level rollback policy.
    pub fn type_policy(mut self, policy: RollbackPolicy) -> Self {
        self.type_policy = Some(policy);
        self
    }
}

/// Wraps transactional work for every registered persistence unit.
pub struct TransactionInterceptor {
    units: HashMap<String, Arc<UnitOfWork>>,
    default_unit: String,
    default_policy: RollbackPolicy,
}

impl TransactionInterceptor {
    pub fn new(default_unit: &str) -> Self {
        Self {
            units: HashMap::new(),
            default_unit: default_unit.to_string(),
            default_policy: RollbackPolicy::default(),
        }
    }

    /// Replace the process-wide default rollback policy.
    pub fn with_default_policy(mut self, policy: RollbackPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Register the unit of work for one persistence unit.
    pub fn register(&mut self, work: Arc<UnitOfWork>) {
        self.units.insert(work.unit().to_string(), work);
    }

    fn resolve_work(&self, meta: &CallMetadata) -> Result<&Arc<UnitOfWork>> {
        let name = meta.unit.as_deref().unwrap_or(&self.default_unit);
        self.units.get(name).ok_or_else(|| {
            PersistError::Config(format!(
                "No unit of work registered for persistence unit '{name}'"
            ))
        })
    }

    fn resolve_policy<'a>(&'a self, meta: &'a CallMetadata) -> &'a RollbackPolicy {
        meta.method_policy
            .as_ref()
            .or(meta.type_policy.as_ref())
            .unwrap_or(&self.default_policy)
    }

    /// Begin the unit of work unless one is already active on this scope.
    ///
    /// When a transfer flag is present it decides ownership: a scope that
    /// started the transaction itself may begin lazily, while a scope the
    /// transaction was transferred *into* must find the work already active.
    /// Returns whether this invocation owns (and must end) the work.
    fn ensure_active_blocking(&self, ctx: &CallContext, work: &UnitOfWork) -> Result<bool> {
        if let Some(started_here) = ctx.get_bool(STARTED_ON_THIS_THREAD) {
            if started_here {
                if !work.is_active(ctx) {
                    work.begin(ctx)?;
                    return Ok(true);
                }
                return Ok(false);
            }
            if !work.is_active(ctx) {
                return Err(PersistError::WorkNotTransferred(work.unit().to_string()));
            }
            return Ok(false);
        }
        if !work.is_active(ctx) {
            work.begin(ctx)?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn ensure_active_reactive(&self, ctx: &CallContext, work: &UnitOfWork) -> Result<bool> {
        if let Some(started_here) = ctx.get_bool(STARTED_ON_THIS_THREAD) {
            if started_here {
                if !work.is_active(ctx) {
                    work.begin_reactive(ctx).await?;
                    return Ok(true);
                }
                return Ok(false);
            }
            if !work.is_active(ctx) {
                return Err(PersistError::WorkNotTransferred(work.unit().to_string()));
            }
            return Ok(false);
        }
        if !work.is_active(ctx) {
            work.begin_reactive(ctx).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Execute `work` transactionally on the blocking path.
    ///
    /// The wrapped closure reaches its session through the scoped context.
    /// If the session already carries an active transaction the call joins it
    /// and the outer invocation stays responsible for commit/rollback.
    /// Otherwise a transaction is begun here; on success it commits (or rolls
    /// back when marked rollback-only), on failure the rollback policy
    /// decides, and the work's failure is always rethrown unchanged.
    pub fn invoke<T, E, F>(
        &self,
        ctx: &CallContext,
        meta: &CallMetadata,
        work: F,
    ) -> std::result::Result<T, TxError<E>>
    where
        E: Fault,
        F: FnOnce(&CallContext) -> std::result::Result<T, E>,
    {
        let unit_of_work = self.resolve_work(meta)?;
        if unit_of_work.is_reactive() {
            return Err(TxError::Persist(PersistError::WrongSessionKind(
                unit_of_work.unit().to_string(),
                "reactive unit requires invoke_reactive()".into(),
            )));
        }

        let entered = !ctx.is_started();
        if entered {
            ctx.enter();
        }
        let result = self.invoke_blocking_inner(ctx, meta, unit_of_work, work);
        if entered {
            ctx.exit();
        }
        result
    }

    fn invoke_blocking_inner<T, E, F>(
        &self,
        ctx: &CallContext,
        meta: &CallMetadata,
        unit_of_work: &Arc<UnitOfWork>,
        work: F,
    ) -> std::result::Result<T, TxError<E>>
    where
        E: Fault,
        F: FnOnce(&CallContext) -> std::result::Result<T, E>,
    {
        let owned = self
            .ensure_active_blocking(ctx, unit_of_work)
            .map_err(TxError::Persist)?;
        let policy = self.resolve_policy(meta);
        let session = ctx
            .blocking_session(unit_of_work.unit())
            .map_err(TxError::Persist)?;

        // Joining semantics: an enclosing transactional call already holds
        // the transaction, so no nested begin/commit.
        if session.is_transaction_active() {
            debug!(unit = %unit_of_work.unit(), "joining enclosing transaction");
            return work(ctx).map_err(TxError::Work);
        }

        session.begin().map_err(TxError::Persist)?;

        let result = match work(ctx) {
            Ok(value) => {
                let completion = if session.is_transaction_active() {
                    if session.is_rollback_only() {
                        session.rollback()
                    } else {
                        session.commit()
                    }
                } else {
                    // The work ended the transaction itself; nothing left to do.
                    Ok(())
                };
                completion.map(|_| value).map_err(TxError::Persist)
            }
            Err(e) => {
                if session.is_transaction_active() {
                    let completion = match policy.decide(e.kind()) {
                        TxOutcome::Rollback => session.rollback(),
                        // Policy says this failure does not void the work:
                        // commit and rethrow anyway.
                        TxOutcome::Commit => {
                            if session.is_rollback_only() {
                                session.rollback()
                            } else {
                                session.commit()
                            }
                        }
                    };
                    if let Err(completion_err) = completion {
                        warn!(
                            unit = %unit_of_work.unit(),
                            error = %completion_err,
                            "transaction completion failed while propagating work failure"
                        );
                    }
                }
                Err(TxError::Work(e))
            }
        };

        if owned {
            unit_of_work.end(ctx);
        }
        result
    }

    /// Execute `work` transactionally on the reactive path.
    ///
    /// The unit of work is begun synchronously (bounded await on the session
    /// open), then the work is scheduled into the session's transactional
    /// callback on a worker task. The callback restores the scope snapshot
    /// captured at submission before touching any scoped state; the live
    /// session is read from that restored scope, which is the single source
    /// of truth for the current session. Any failure inside the callback
    /// marks the transaction for rollback and propagates to the returned
    /// result.
    pub async fn invoke_reactive<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        meta: &CallMetadata,
        work: F,
    ) -> std::result::Result<T, TxError<E>>
    where
        T: Send + 'static,
        E: Fault,
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let unit_of_work = Arc::clone(self.resolve_work(meta)?);
        if !unit_of_work.is_reactive() {
            return Err(TxError::Persist(PersistError::WrongSessionKind(
                unit_of_work.unit().to_string(),
                "blocking unit requires invoke()".into(),
            )));
        }

        let entered = !ctx.is_started();
        if entered {
            ctx.enter();
        }
        let result = self.invoke_reactive_inner(ctx, &unit_of_work, work).await;
        if entered {
            ctx.exit();
        }
        result
    }

    async fn invoke_reactive_inner<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        unit_of_work: &Arc<UnitOfWork>,
        work: F,
    ) -> std::result::Result<T, TxError<E>>
    where
        T: Send + 'static,
        E: Fault,
        F: FnOnce(CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let owned = self
            .ensure_active_reactive(ctx, unit_of_work)
            .await
            .map_err(TxError::Persist)?;

        // Snapshot after begin so the live session travels with the scope.
        let snapshot = ctx.snapshot();
        let unit = unit_of_work.unit().to_string();

        let task = tokio::spawn(Self::run_transactional(snapshot, unit, work));
        let result = match task.await {
            Ok(r) => r,
            Err(join_err) => Err(TxError::Persist(PersistError::Canceled(
                join_err.to_string(),
            ))),
        };

        if owned {
            unit_of_work.end_reactive(ctx).await;
        }
        result
    }

    /// The transactional callback body, running on a worker task.
    async fn run_transactional<T, E, F, Fut>(
        snapshot: ContextSnapshot,
        unit: String,
        work: F,
    ) -> std::result::Result<T, TxError<E>>
    where
        E: Fault,
        F: FnOnce(CallContext) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
    {
        // Fully restore and re-enter the scope before any scoped state is
        // read, so a partially-restored context is never observable.
        let scope = CallContext::new();
        scope.restore(snapshot);
        scope.enter();
        let result = Self::run_in_scope(&scope, &unit, work).await;
        scope.exit();
        result
    }

    async fn run_in_scope<T, E, F, Fut>(
        scope: &CallContext,
        unit: &str,
        work: F,
    ) -> std::result::Result<T, TxError<E>>
    where
        E: Fault,
        F: FnOnce(CallContext) -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
    {
        let session = scope.reactive_session(unit).map_err(TxError::Persist)?;

        if session.is_transaction_active() {
            debug!(unit = %unit, "joining enclosing reactive transaction");
            return work(scope.clone()).await.map_err(TxError::Work);
        }

        session.begin().await.map_err(TxError::Persist)?;
        match work(scope.clone()).await {
            Ok(value) => {
                let completion = if session.is_transaction_active() {
                    if session.is_rollback_only() {
                        session.rollback().await
                    } else {
                        session.commit().await
                    }
                } else {
                    // The work ended the transaction itself; nothing left to do.
                    Ok(())
                };
                completion.map(|_| value).map_err(TxError::Persist)
            }
            Err(e) => {
                session.mark_rollback_only();
                if session.is_transaction_active() {
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(unit = %unit, error = %rollback_err, "reactive rollback failed");
                    }
                }
                Err(TxError::Work(e))
            }
        }
    }
}
