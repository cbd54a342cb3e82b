// ============================================================================
// txnscope Library
// ============================================================================
//
// Transactional unit-of-work coordination for persistence units. One uniform
// "transactional call" contract covers two concurrency models: blocking
// sessions driven on the calling thread, and reactive sessions whose work is
// scheduled into an asynchronous transactional callback. Per-call state lives
// in an explicit scoped context that can be snapshotted and restored across
// thread hops.

pub mod config;
pub mod context;
pub mod core;
pub mod module;
pub mod session;
pub mod txn;
pub mod work;

// Re-export main types for convenience
pub use crate::core::{PersistError, Result};
pub use config::{ConnectionDescriptor, PersistenceConfig};
pub use context::{CallContext, ContextSnapshot, ContextValue, session_key, STARTED_ON_THIS_THREAD};
pub use module::{PersistenceModule, PersistenceUnit};
pub use session::{
    BlockingSession, EngineBuilder, EngineHandle, MemoryEngineBuilder, ReactiveSession,
    ReactiveSessionFactory, SessionFactory, SessionFactoryProvider,
};
pub use txn::{CallMetadata, Fault, FaultKind, RollbackPolicy, TransactionInterceptor, TxError, TxOutcome};
pub use work::{UnitOfWork, WorkItem};
