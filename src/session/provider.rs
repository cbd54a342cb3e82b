// ============================================================================
// Session Factory Provider
// ============================================================================

use super::{EngineBuilder, EngineHandle, ReactiveSessionFactory, SessionFactory};
use crate::config::ConnectionDescriptor;
use crate::core::{PersistError, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Owns the canonical engine handle for one persistence unit.
///
/// The handle is constructed lazily on first use and shared process-wide.
/// `start()` serializes concurrent first-time construction: exactly one caller
/// builds the handle, the rest observe the completed result. A failed
/// construction caches nothing, so the next call retries from scratch.
pub struct SessionFactoryProvider {
    descriptor: ConnectionDescriptor,
    builder: Arc<dyn EngineBuilder>,
    handle: Mutex<Option<EngineHandle>>,
}

impl SessionFactoryProvider {
    pub fn new(descriptor: ConnectionDescriptor, builder: Arc<dyn EngineBuilder>) -> Self {
        Self {
            descriptor,
            builder,
            handle: Mutex::new(None),
        }
    }

    pub fn unit_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Construct the engine handle if it does not exist yet. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock()?;
        if handle.is_some() {
            return Ok(());
        }
        let built = self.builder.build(&self.descriptor)?;
        debug!(unit = %self.descriptor.name, reactive = built.is_reactive(), "engine handle constructed");
        *handle = Some(built);
        Ok(())
    }

    /// Whether the handle has been constructed.
    pub fn is_started(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.is_some())
            .unwrap_or(false)
    }

    /// Return the engine handle, constructing it first if necessary.
    pub fn handle(&self) -> Result<EngineHandle> {
        let mut handle = self.handle.lock()?;
        if let Some(existing) = handle.as_ref() {
            return Ok(existing.clone());
        }
        let built = self.builder.build(&self.descriptor)?;
        debug!(unit = %self.descriptor.name, reactive = built.is_reactive(), "engine handle constructed");
        *handle = Some(built.clone());
        Ok(built)
    }

    /// The blocking session factory for this unit.
    ///
    /// # Errors
    /// Fails when the unit is reactive.
    pub fn blocking_factory(&self) -> Result<Arc<dyn SessionFactory>> {
        match self.handle()? {
            EngineHandle::Blocking(factory) => Ok(factory),
            EngineHandle::Reactive(_) => Err(PersistError::WrongSessionKind(
                self.descriptor.name.clone(),
                "unit is reactive; use the reactive factory".into(),
            )),
        }
    }

    /// The reactive session factory for this unit.
    ///
    /// # Errors
    /// Fails when the unit is blocking.
    pub fn reactive_factory(&self) -> Result<Arc<dyn ReactiveSessionFactory>> {
        match self.handle()? {
            EngineHandle::Reactive(factory) => Ok(factory),
            EngineHandle::Blocking(_) => Err(PersistError::WrongSessionKind(
                self.descriptor.name.clone(),
                "unit is blocking; use the blocking factory".into(),
            )),
        }
    }

    /// Close the handle if open. Idempotent; teardown failures are logged and
    /// not propagated.
    pub fn stop(&self) {
        let mut handle = match self.handle.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = handle.take() {
            if let Err(e) = existing.close() {
                warn!(unit = %self.descriptor.name, error = %e, "engine handle close failed");
            } else {
                debug!(unit = %self.descriptor.name, "engine handle closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryEngineBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` build attempts, then succeeds.
    struct FlakyBuilder {
        failures: usize,
        attempts: AtomicUsize,
        inner: MemoryEngineBuilder,
    }

    impl EngineBuilder for FlakyBuilder {
        fn build(&self, descriptor: &ConnectionDescriptor) -> Result<EngineHandle> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(PersistError::Engine("simulated construction failure".into()));
            }
            self.inner.build(descriptor)
        }
    }

    fn provider() -> SessionFactoryProvider {
        SessionFactoryProvider::new(
            ConnectionDescriptor::new("unit-a"),
            Arc::new(MemoryEngineBuilder),
        )
    }

    #[test]
    fn test_start_is_idempotent() {
        let provider = provider();
        assert!(!provider.is_started());
        provider.start().unwrap();
        assert!(provider.is_started());
        provider.start().unwrap();
        assert!(provider.is_started());
    }

    #[test]
    fn test_handle_lazily_starts() {
        let provider = provider();
        let handle = provider.handle().unwrap();
        assert!(!handle.is_reactive());
        assert!(provider.is_started());
    }

    #[test]
    fn test_failed_start_is_retryable() {
        let provider = SessionFactoryProvider::new(
            ConnectionDescriptor::new("unit-a"),
            Arc::new(FlakyBuilder {
                failures: 1,
                attempts: AtomicUsize::new(0),
                inner: MemoryEngineBuilder,
            }),
        );

        assert!(provider.start().is_err());
        // Nothing half-initialized was cached.
        assert!(!provider.is_started());
        provider.start().unwrap();
        assert!(provider.is_started());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let provider = provider();
        provider.start().unwrap();
        provider.stop();
        assert!(!provider.is_started());
        provider.stop();
    }

    #[test]
    fn test_concurrent_start_constructs_once() {
        let builder = Arc::new(FlakyBuilder {
            failures: 0,
            attempts: AtomicUsize::new(0),
            inner: MemoryEngineBuilder,
        });
        let provider = Arc::new(SessionFactoryProvider::new(
            ConnectionDescriptor::new("unit-a"),
            Arc::clone(&builder) as Arc<dyn EngineBuilder>,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&provider);
                std::thread::spawn(move || p.start().unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(provider.is_started());
        assert_eq!(builder.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let provider = SessionFactoryProvider::new(
            ConnectionDescriptor::new("unit-r").reactive(true),
            Arc::new(MemoryEngineBuilder),
        );
        assert!(matches!(
            provider.blocking_factory(),
            Err(PersistError::WrongSessionKind(_, _))
        ));
        assert!(provider.reactive_factory().is_ok());
    }
}
