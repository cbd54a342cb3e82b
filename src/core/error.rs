use thiserror::Error;

/// Crate-level error type.
///
/// Configuration and ordering violations are fatal for the current call and
/// are never converted into a silent no-op path. Failures thrown by wrapped
/// transactional work are *not* represented here; those stay in the caller's
/// own error type and only drive the commit/rollback decision.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Work already begun for unit '{0}'. Looks like begin() was called twice without a balancing call to end() in between")]
    WorkAlreadyBegun(String),

    #[error("Transaction was transferred into this scope for unit '{0}' but no unit of work is active")]
    WorkNotTransferred(String),

    #[error("Session factory for unit '{0}' is not started. Call SessionFactoryProvider::start() before begin()")]
    FactoryNotStarted(String),

    #[error("No session bound for unit '{0}' in the current scope")]
    SessionMissing(String),

    #[error("Expected a reactive session for unit '{0}' but none was bound in the current scope")]
    ReactiveSessionMissing(String),

    #[error("Wrong session kind for unit '{0}': {1}")]
    WrongSessionKind(String, String),

    #[error("No call scope is open on this context")]
    NoScope,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Transaction state error: {0}")]
    TxnState(String),

    #[error("Transactional task canceled: {0}")]
    Canceled(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
