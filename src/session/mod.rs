// ============================================================================
// Session and Factory Seams
// ============================================================================
//
// The coordination core talks to the persistence engine exclusively through
// these traits. Constructing engine handles from connection parameters is the
// engine builder's job; the core never derives connection details itself.

pub mod memory;
pub mod provider;

use crate::config::ConnectionDescriptor;
use crate::core::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// A blocking database session. Transaction state lives inside the session;
/// the interceptor drives it but never owns it.
///
/// Implementations use interior mutability: sessions are shared as
/// `Arc<dyn BlockingSession>` through the scoped context.
pub trait BlockingSession: Send + Sync {
    /// Begin a transaction on this session.
    fn begin(&self) -> Result<()>;

    /// Commit the active transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the active transaction.
    fn rollback(&self) -> Result<()>;

    /// Whether a transaction is currently active.
    fn is_transaction_active(&self) -> bool;

    /// Mark the active transaction so that it can only roll back.
    fn mark_rollback_only(&self);

    /// Whether the active transaction has been marked rollback-only.
    fn is_rollback_only(&self) -> bool;

    /// Close the session, releasing its underlying resources. An active
    /// transaction is rolled back first.
    fn close(&self) -> Result<()>;

    /// Downcast support for engine-specific session operations.
    fn as_any(&self) -> &dyn Any;
}

/// A non-blocking session whose operations complete via awaited futures
/// rather than blocking calls.
#[async_trait]
pub trait ReactiveSession: Send + Sync {
    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    fn is_transaction_active(&self) -> bool;

    fn mark_rollback_only(&self);

    fn is_rollback_only(&self) -> bool;

    async fn close(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Factory for blocking sessions.
pub trait SessionFactory: Send + Sync {
    fn open_session(&self) -> Result<Arc<dyn BlockingSession>>;

    /// Close the factory. Closing twice is a no-op.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Factory for reactive sessions. Session opening is asynchronous; callers
/// bound the await with the unit's configured open timeout.
#[async_trait]
pub trait ReactiveSessionFactory: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn ReactiveSession>>;

    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// The canonical engine handle for one persistence unit.
#[derive(Clone)]
pub enum EngineHandle {
    Blocking(Arc<dyn SessionFactory>),
    Reactive(Arc<dyn ReactiveSessionFactory>),
}

impl EngineHandle {
    pub fn is_reactive(&self) -> bool {
        matches!(self, EngineHandle::Reactive(_))
    }

    pub fn is_open(&self) -> bool {
        match self {
            EngineHandle::Blocking(f) => f.is_open(),
            EngineHandle::Reactive(f) => f.is_open(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            EngineHandle::Blocking(f) => f.close(),
            EngineHandle::Reactive(f) => f.close(),
        }
    }
}

/// Builds engine handles from unit descriptors. Supplied by the embedding
/// application; invoked lazily by the session factory provider.
pub trait EngineBuilder: Send + Sync {
    fn build(&self, descriptor: &ConnectionDescriptor) -> Result<EngineHandle>;
}

pub use memory::{MemoryEngineBuilder, MemoryReactiveSessionFactory, MemorySession, MemorySessionFactory};
pub use provider::SessionFactoryProvider;
