// ============================================================================
// Call-Scoped Context
// ============================================================================
//
// A per-logical-call key/value store with explicit enter/exit and
// snapshot/restore. The context is passed by parameter through the
// interception chain instead of living in ambient thread-local state, which
// makes cross-thread transfer an explicit, typed operation.

use crate::core::{PersistError, Result};
use crate::session::{BlockingSession, ReactiveSession};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Scoped flag recording whether the transaction backing the current work was
/// started on the submitting thread or transferred in from elsewhere.
pub const STARTED_ON_THIS_THREAD: &str = "work.started_on_this_thread";

/// Well-known context key under which the live session of a persistence unit
/// is bound. At most one session per unit name may be bound at any time.
pub fn session_key(unit: &str) -> String {
    format!("work.session.{unit}")
}

/// A value stored in the scoped context.
#[derive(Clone)]
pub enum ContextValue {
    Bool(bool),
    Str(String),
    Blocking(Arc<dyn BlockingSession>),
    Reactive(Arc<dyn ReactiveSession>),
}

impl std::fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextValue::Bool(b) => write!(f, "Bool({b})"),
            ContextValue::Str(s) => write!(f, "Str({s:?})"),
            ContextValue::Blocking(_) => write!(f, "Blocking(<session>)"),
            ContextValue::Reactive(_) => write!(f, "Reactive(<session>)"),
        }
    }
}

/// A snapshot of a context's values, taken on one thread for restoration on
/// another. Snapshots are plain data plus shared session handles; restoring
/// one replaces the destination's full value map.
#[derive(Clone, Default)]
pub struct ContextSnapshot {
    pub(crate) values: HashMap<String, ContextValue>,
}

impl ContextSnapshot {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Default)]
struct ContextInner {
    depth: usize,
    values: HashMap<String, ContextValue>,
}

/// The scoped context for one logical call.
///
/// Cloning produces another handle to the same scope (the scope itself is
/// never shared between logical calls; handles are cloned only to follow one
/// call across its own thread hops).
#[derive(Clone, Default)]
pub struct CallContext {
    inner: Arc<Mutex<ContextInner>>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the scope. Scopes nest; each `enter()` must be balanced by one
    /// `exit()`.
    pub fn enter(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.depth += 1;
    }

    /// Close the scope. When the outermost scope exits, all values are
    /// dropped; sessions still bound at that point are released with a
    /// warning, since a well-behaved caller ends its unit of work first.
    pub fn exit(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.depth == 0 {
            return;
        }
        inner.depth -= 1;
        if inner.depth == 0 {
            let lingering: Vec<String> = inner
                .values
                .iter()
                .filter(|(_, v)| {
                    matches!(v, ContextValue::Blocking(_) | ContextValue::Reactive(_))
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in &lingering {
                warn!(key = %key, "scope exited with a session still bound; releasing");
            }
            inner.values.clear();
        }
    }

    /// Whether a scope is currently open on this logical call.
    pub fn is_started(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).depth > 0
    }

    /// Bind a value under `key`.
    ///
    /// # Errors
    /// Fails with [`PersistError::NoScope`] when no scope is open.
    pub fn put(&self, key: &str, value: ContextValue) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner.depth == 0 {
            return Err(PersistError::NoScope);
        }
        inner.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Read a value. Returns `None` when no scope is open or the key is
    /// absent; reads are deliberately harmless.
    pub fn get(&self, key: &str) -> Option<ContextValue> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.depth == 0 {
            return None;
        }
        inner.values.get(key).cloned()
    }

    /// Read a boolean flag.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(ContextValue::Bool(b)) => Some(b),
            _ => None,
        }
    }

    /// Whether a value is bound under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove and return the value bound under `key`, if any. Like `get`,
    /// this touches nothing when no scope is open.
    pub fn remove(&self, key: &str) -> Option<ContextValue> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.depth == 0 {
            return None;
        }
        inner.values.remove(key)
    }

    /// Capture the current values for transfer to another thread.
    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        ContextSnapshot {
            values: inner.values.clone(),
        }
    }

    /// Replace this context's values with a captured snapshot. Must be
    /// followed by `enter()` before any scoped state is read or written, so a
    /// partially-restored context is never observable.
    pub fn restore(&self, snapshot: ContextSnapshot) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values = snapshot.values;
    }

    /// Fetch the blocking session bound for `unit`.
    pub fn blocking_session(&self, unit: &str) -> Result<Arc<dyn BlockingSession>> {
        match self.get(&session_key(unit)) {
            Some(ContextValue::Blocking(session)) => Ok(session),
            Some(_) => Err(PersistError::WrongSessionKind(
                unit.to_string(),
                "a reactive session is bound where a blocking one was expected".into(),
            )),
            None => Err(PersistError::SessionMissing(unit.to_string())),
        }
    }

    /// Fetch the reactive session bound for `unit`.
    pub fn reactive_session(&self, unit: &str) -> Result<Arc<dyn ReactiveSession>> {
        match self.get(&session_key(unit)) {
            Some(ContextValue::Reactive(session)) => Ok(session),
            Some(_) => Err(PersistError::WrongSessionKind(
                unit.to_string(),
                "a blocking session is bound where a reactive one was expected".into(),
            )),
            None => Err(PersistError::ReactiveSessionMissing(unit.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_requires_open_scope() {
        let ctx = CallContext::new();
        assert!(matches!(
            ctx.put("k", ContextValue::Bool(true)),
            Err(PersistError::NoScope)
        ));

        ctx.enter();
        ctx.put("k", ContextValue::Bool(true)).unwrap();
        assert_eq!(ctx.get_bool("k"), Some(true));
        ctx.exit();
    }

    #[test]
    fn test_exit_clears_values() {
        let ctx = CallContext::new();
        ctx.enter();
        ctx.put("k", ContextValue::Str("v".into())).unwrap();
        ctx.exit();

        assert!(!ctx.is_started());
        ctx.enter();
        assert!(!ctx.contains("k"));
        ctx.exit();
    }

    #[test]
    fn test_nested_scopes_keep_values() {
        let ctx = CallContext::new();
        ctx.enter();
        ctx.put("k", ContextValue::Bool(false)).unwrap();
        ctx.enter();
        assert_eq!(ctx.get_bool("k"), Some(false));
        ctx.exit();
        // Still inside the outer scope.
        assert_eq!(ctx.get_bool("k"), Some(false));
        ctx.exit();
    }

    #[test]
    fn test_snapshot_restore_transfers_values() {
        let source = CallContext::new();
        source.enter();
        source.put("shared", ContextValue::Str("payload".into())).unwrap();
        let snapshot = source.snapshot();
        source.exit();

        let dest = CallContext::new();
        dest.restore(snapshot);
        dest.enter();
        match dest.get("shared") {
            Some(ContextValue::Str(s)) => assert_eq!(s, "payload"),
            other => panic!("unexpected value: {other:?}"),
        }
        dest.exit();
    }

    #[test]
    fn test_contexts_are_isolated() {
        let a = CallContext::new();
        let b = CallContext::new();
        a.enter();
        b.enter();
        a.put("k", ContextValue::Bool(true)).unwrap();
        assert!(!b.contains("k"));
        a.exit();
        b.exit();
    }

    #[test]
    fn test_remove_requires_open_scope() {
        // Restored-but-not-entered values must stay intact until the scope
        // actually opens.
        let source = CallContext::new();
        source.enter();
        source.put("k", ContextValue::Str("v".into())).unwrap();
        let snapshot = source.snapshot();
        source.exit();

        let dest = CallContext::new();
        dest.restore(snapshot);
        assert!(dest.remove("k").is_none());
        dest.enter();
        assert!(dest.contains("k"));
        assert!(dest.remove("k").is_some());
        dest.exit();
    }

    #[test]
    fn test_unbalanced_exit_is_harmless() {
        let ctx = CallContext::new();
        ctx.exit();
        assert!(!ctx.is_started());
    }
}
