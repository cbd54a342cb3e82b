// ============================================================================
// Unit of Work
// ============================================================================

pub mod item;

use crate::context::{session_key, CallContext, ContextValue};
use crate::core::{PersistError, Result};
use crate::session::SessionFactoryProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use item::WorkItem;

/// The bound lifecycle of one session within one logical call scope.
///
/// A unit of work is constructed once at wiring time for its persistence unit
/// and is stateless between calls: all per-call state lives in the scoped
/// context under the unit's session key. `begin()` binds a fresh session into
/// the active scope, `end()` removes and closes it.
///
/// Double `begin()` is a programming error and fails loudly; `end()` without a
/// bound session is a harmless no-op.
pub struct UnitOfWork {
    unit: String,
    reactive: bool,
    provider: Arc<SessionFactoryProvider>,
    open_timeout: Duration,
}

impl UnitOfWork {
    pub fn new(provider: Arc<SessionFactoryProvider>) -> Self {
        let descriptor = provider.descriptor();
        Self {
            unit: descriptor.name.clone(),
            reactive: descriptor.reactive,
            open_timeout: descriptor.session_open_timeout,
            provider,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn is_reactive(&self) -> bool {
        self.reactive
    }

    /// Whether a session for this unit is bound in the given scope.
    pub fn is_active(&self, ctx: &CallContext) -> bool {
        ctx.contains(&session_key(&self.unit))
    }

    fn check_preconditions(&self, ctx: &CallContext) -> Result<()> {
        if self.is_active(ctx) {
            return Err(PersistError::WorkAlreadyBegun(self.unit.clone()));
        }
        // The provider must have been started explicitly: auto-starting here
        // could mask configuration errors until deep inside a transaction.
        if !self.provider.is_started() {
            return Err(PersistError::FactoryNotStarted(self.unit.clone()));
        }
        Ok(())
    }

    /// Begin a blocking unit of work: open a session and bind it into the
    /// active scope.
    pub fn begin(&self, ctx: &CallContext) -> Result<()> {
        self.check_preconditions(ctx)?;
        if self.reactive {
            return Err(PersistError::WrongSessionKind(
                self.unit.clone(),
                "unit is reactive; use begin_reactive()".into(),
            ));
        }
        let session = self.provider.blocking_factory()?.open_session()?;
        ctx.put(&session_key(&self.unit), ContextValue::Blocking(session))?;
        debug!(unit = %self.unit, "unit of work begun");
        Ok(())
    }

    /// Begin a reactive unit of work. The await is a deliberate synchronous
    /// control point, bounded by the unit's configured open timeout: once it
    /// completes, the "is a unit of work active" question has a stable answer
    /// even though all downstream session use is asynchronous.
    pub async fn begin_reactive(&self, ctx: &CallContext) -> Result<()> {
        self.check_preconditions(ctx)?;
        if !self.reactive {
            return Err(PersistError::WrongSessionKind(
                self.unit.clone(),
                "unit is blocking; use begin()".into(),
            ));
        }
        let factory = self.provider.reactive_factory()?;
        let session = tokio::time::timeout(self.open_timeout, factory.open_session())
            .await
            .map_err(|_| {
                PersistError::Timeout(format!(
                    "Opening a reactive session for unit '{}' exceeded {:?}",
                    self.unit, self.open_timeout
                ))
            })??;
        ctx.put(&session_key(&self.unit), ContextValue::Reactive(session))?;
        debug!(unit = %self.unit, "reactive unit of work begun");
        Ok(())
    }

    /// End the unit of work: unbind and close the session. No-op when no
    /// session is bound. Close failures never prevent the context entry from
    /// being released.
    pub fn end(&self, ctx: &CallContext) {
        match ctx.remove(&session_key(&self.unit)) {
            Some(ContextValue::Blocking(session)) => {
                if let Err(e) = session.close() {
                    warn!(unit = %self.unit, error = %e, "session close failed");
                }
                debug!(unit = %self.unit, "unit of work ended");
            }
            Some(ContextValue::Reactive(_)) => {
                // Dropped without an async close; the handle going away still
                // releases the session on the engine side.
                warn!(unit = %self.unit, "reactive session discarded by blocking end(); use end_reactive()");
            }
            Some(other) => {
                warn!(unit = %self.unit, value = ?other, "unexpected value under session key");
            }
            None => {}
        }
    }

    /// End a reactive unit of work, closing the session asynchronously.
    /// No-op when no session is bound.
    pub async fn end_reactive(&self, ctx: &CallContext) {
        match ctx.remove(&session_key(&self.unit)) {
            Some(ContextValue::Reactive(session)) => {
                if let Err(e) = session.close().await {
                    warn!(unit = %self.unit, error = %e, "reactive session close failed");
                }
                debug!(unit = %self.unit, "reactive unit of work ended");
            }
            Some(ContextValue::Blocking(session)) => {
                if let Err(e) = session.close() {
                    warn!(unit = %self.unit, error = %e, "session close failed");
                }
            }
            Some(other) => {
                warn!(unit = %self.unit, value = ?other, "unexpected value under session key");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionDescriptor;
    use crate::session::MemoryEngineBuilder;

    fn blocking_work() -> UnitOfWork {
        let provider = Arc::new(SessionFactoryProvider::new(
            ConnectionDescriptor::new("unit-a"),
            Arc::new(MemoryEngineBuilder),
        ));
        provider.start().unwrap();
        UnitOfWork::new(provider)
    }

    fn reactive_work(descriptor: ConnectionDescriptor) -> UnitOfWork {
        let provider = Arc::new(SessionFactoryProvider::new(
            descriptor.reactive(true),
            Arc::new(MemoryEngineBuilder),
        ));
        provider.start().unwrap();
        UnitOfWork::new(provider)
    }

    #[test]
    fn test_begin_binds_session() {
        let work = blocking_work();
        let ctx = CallContext::new();
        ctx.enter();

        assert!(!work.is_active(&ctx));
        work.begin(&ctx).unwrap();
        assert!(work.is_active(&ctx));
        assert!(ctx.blocking_session("unit-a").is_ok());

        work.end(&ctx);
        assert!(!work.is_active(&ctx));
        ctx.exit();
    }

    #[test]
    fn test_double_begin_fails_loudly() {
        let work = blocking_work();
        let ctx = CallContext::new();
        ctx.enter();

        work.begin(&ctx).unwrap();
        assert!(matches!(
            work.begin(&ctx),
            Err(PersistError::WorkAlreadyBegun(_))
        ));
        work.end(&ctx);
        ctx.exit();
    }

    #[test]
    fn test_end_without_begin_is_noop() {
        let work = blocking_work();
        let ctx = CallContext::new();
        ctx.enter();
        work.end(&ctx);
        work.end(&ctx);
        ctx.exit();
    }

    #[test]
    fn test_begin_requires_started_provider() {
        let provider = Arc::new(SessionFactoryProvider::new(
            ConnectionDescriptor::new("unit-a"),
            Arc::new(MemoryEngineBuilder),
        ));
        let work = UnitOfWork::new(provider);
        let ctx = CallContext::new();
        ctx.enter();

        assert!(matches!(
            work.begin(&ctx),
            Err(PersistError::FactoryNotStarted(_))
        ));
        ctx.exit();
    }

    #[tokio::test]
    async fn test_reactive_begin_and_end() {
        let work = reactive_work(ConnectionDescriptor::new("unit-r"));
        let ctx = CallContext::new();
        ctx.enter();

        work.begin_reactive(&ctx).await.unwrap();
        assert!(work.is_active(&ctx));
        assert!(ctx.reactive_session("unit-r").is_ok());

        work.end_reactive(&ctx).await;
        assert!(!work.is_active(&ctx));
        ctx.exit();
    }

    #[tokio::test]
    async fn test_reactive_open_timeout() {
        let descriptor = ConnectionDescriptor::new("unit-slow")
            .session_open_timeout(Duration::from_millis(20))
            .property("open_delay_ms", "5000");
        let work = reactive_work(descriptor);
        let ctx = CallContext::new();
        ctx.enter();

        let err = work.begin_reactive(&ctx).await.unwrap_err();
        assert!(matches!(err, PersistError::Timeout(_)));
        assert!(!work.is_active(&ctx));
        ctx.exit();
    }

    #[tokio::test]
    async fn test_blocking_begin_on_reactive_unit_rejected() {
        let work = reactive_work(ConnectionDescriptor::new("unit-r"));
        let ctx = CallContext::new();
        ctx.enter();
        assert!(matches!(
            work.begin(&ctx),
            Err(PersistError::WrongSessionKind(_, _))
        ));
        ctx.exit();
    }
}
