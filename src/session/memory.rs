// ============================================================================
// In-Memory Engine
// ============================================================================
//
// A small key/value engine with staged transactional writes, in blocking and
// reactive flavors. It backs the crate's own tests and serves as the
// reference implementation of the session traits: writes made inside a
// transaction stay in a staging buffer until commit and are discarded on
// rollback.

use super::{
    BlockingSession, EngineBuilder, EngineHandle, ReactiveSession, ReactiveSessionFactory,
    SessionFactory,
};
use crate::config::ConnectionDescriptor;
use crate::core::{PersistError, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

type Store = Arc<Mutex<HashMap<String, String>>>;

#[derive(Default)]
struct SessionState {
    txn_active: bool,
    rollback_only: bool,
    staged: Vec<(String, String)>,
    closed: bool,
}

/// A blocking in-memory session.
pub struct MemorySession {
    id: Uuid,
    store: Store,
    state: Mutex<SessionState>,
}

impl MemorySession {
    fn new(store: Store) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Write a key/value pair. Staged while a transaction is active, written
    /// through otherwise.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(PersistError::Engine("Session is closed".into()));
        }
        if state.txn_active {
            state.staged.push((key.to_string(), value.to_string()));
        } else {
            self.store.lock()?.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Read a value, seeing this session's own staged writes first.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock()?;
        if state.closed {
            return Err(PersistError::Engine("Session is closed".into()));
        }
        if let Some((_, value)) = state.staged.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.store.lock()?.get(key).cloned())
    }
}

impl BlockingSession for MemorySession {
    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(PersistError::Engine("Session is closed".into()));
        }
        if state.txn_active {
            return Err(PersistError::TxnState("Transaction already active".into()));
        }
        state.txn_active = true;
        state.rollback_only = false;
        debug!(session = %self.id, "transaction begun");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.txn_active {
            return Err(PersistError::TxnState("No active transaction to commit".into()));
        }
        let staged = std::mem::take(&mut state.staged);
        {
            let mut store = self.store.lock()?;
            for (key, value) in staged {
                store.insert(key, value);
            }
        }
        state.txn_active = false;
        state.rollback_only = false;
        debug!(session = %self.id, "transaction committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.txn_active {
            return Err(PersistError::TxnState("No active transaction to roll back".into()));
        }
        state.staged.clear();
        state.txn_active = false;
        state.rollback_only = false;
        debug!(session = %self.id, "transaction rolled back");
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.state.lock().map(|s| s.txn_active).unwrap_or(false)
    }

    fn mark_rollback_only(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.txn_active {
                state.rollback_only = true;
            }
        }
    }

    fn is_rollback_only(&self) -> bool {
        self.state.lock().map(|s| s.rollback_only).unwrap_or(false)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Ok(());
        }
        if state.txn_active {
            state.staged.clear();
            state.txn_active = false;
        }
        state.closed = true;
        debug!(session = %self.id, "session closed");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A reactive in-memory session: the same staging semantics behind awaited
/// operations.
pub struct MemoryReactiveSession {
    inner: MemorySession,
}

impl MemoryReactiveSession {
    fn new(store: Store) -> Self {
        Self {
            inner: MemorySession::new(store),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.inner.put(key, value)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.get(key)
    }
}

#[async_trait]
impl ReactiveSession for MemoryReactiveSession {
    async fn begin(&self) -> Result<()> {
        tokio::task::yield_now().await;
        BlockingSession::begin(&self.inner)
    }

    async fn commit(&self) -> Result<()> {
        tokio::task::yield_now().await;
        BlockingSession::commit(&self.inner)
    }

    async fn rollback(&self) -> Result<()> {
        tokio::task::yield_now().await;
        BlockingSession::rollback(&self.inner)
    }

    fn is_transaction_active(&self) -> bool {
        self.inner.is_transaction_active()
    }

    fn mark_rollback_only(&self) {
        self.inner.mark_rollback_only();
    }

    fn is_rollback_only(&self) -> bool {
        self.inner.is_rollback_only()
    }

    async fn close(&self) -> Result<()> {
        tokio::task::yield_now().await;
        BlockingSession::close(&self.inner)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory for blocking in-memory sessions sharing one store.
pub struct MemorySessionFactory {
    store: Store,
    open: AtomicBool,
}

impl MemorySessionFactory {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
            open: AtomicBool::new(true),
        }
    }
}

impl Default for MemorySessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for MemorySessionFactory {
    fn open_session(&self) -> Result<Arc<dyn BlockingSession>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PersistError::Engine("Session factory is closed".into()));
        }
        Ok(Arc::new(MemorySession::new(Arc::clone(&self.store))))
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Factory for reactive in-memory sessions. An optional open delay simulates
/// the latency of establishing a real asynchronous session.
pub struct MemoryReactiveSessionFactory {
    store: Store,
    open: AtomicBool,
    open_delay: Option<Duration>,
}

impl MemoryReactiveSessionFactory {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
            open: AtomicBool::new(true),
            open_delay: None,
        }
    }

    /// Delay every `open_session` by the given duration.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

impl Default for MemoryReactiveSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReactiveSessionFactory for MemoryReactiveSessionFactory {
    async fn open_session(&self) -> Result<Arc<dyn ReactiveSession>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PersistError::Engine("Session factory is closed".into()));
        }
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        Ok(Arc::new(MemoryReactiveSession::new(Arc::clone(&self.store))))
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Engine builder producing in-memory factories: reactive units get a
/// [`MemoryReactiveSessionFactory`], blocking units a [`MemorySessionFactory`].
///
/// Recognized descriptor properties:
/// - `open_delay_ms`: per-open delay for reactive factories.
pub struct MemoryEngineBuilder;

impl EngineBuilder for MemoryEngineBuilder {
    fn build(&self, descriptor: &ConnectionDescriptor) -> Result<EngineHandle> {
        if descriptor.reactive {
            let mut factory = MemoryReactiveSessionFactory::new();
            if let Some(raw) = descriptor.properties.get("open_delay_ms") {
                let millis: u64 = raw.parse().map_err(|_| {
                    PersistError::Config(format!(
                        "Invalid open_delay_ms '{raw}' for unit '{}'",
                        descriptor.name
                    ))
                })?;
                factory = factory.with_open_delay(Duration::from_millis(millis));
            }
            Ok(EngineHandle::Reactive(Arc::new(factory)))
        } else {
            Ok(EngineHandle::Blocking(Arc::new(MemorySessionFactory::new())))
        }
    }
}
