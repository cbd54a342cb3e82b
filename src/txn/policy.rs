// ============================================================================
// Rollback Policy
// ============================================================================

/// Hierarchical classification of a work failure, used to match policy
/// clauses. `covers()` is the subtype relation: `Any` covers everything,
/// `Io` covers the concrete I/O kinds, `Constraint` covers the concrete
/// constraint violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Matches every failure.
    Any,
    /// Any input/output failure.
    Io,
    NotFound,
    PermissionDenied,
    Interrupted,
    /// Any constraint violation.
    Constraint,
    UniqueViolation,
    ForeignKeyViolation,
    Timeout,
    /// Application-defined failure outside the built-in taxonomy.
    App,
}

impl FaultKind {
    /// Whether a policy clause of this kind matches a failure of `other`.
    pub fn covers(self, other: FaultKind) -> bool {
        if self == other {
            return true;
        }
        match self {
            FaultKind::Any => true,
            FaultKind::Io => matches!(
                other,
                FaultKind::NotFound | FaultKind::PermissionDenied | FaultKind::Interrupted
            ),
            FaultKind::Constraint => matches!(
                other,
                FaultKind::UniqueViolation | FaultKind::ForeignKeyViolation
            ),
            _ => false,
        }
    }
}

/// A failure thrown by wrapped transactional work. The interceptor only ever
/// reads the classification; the error itself propagates to the caller
/// unchanged in type and identity.
pub trait Fault: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> FaultKind;
}

impl Fault for std::io::Error {
    fn kind(&self) -> FaultKind {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::NotFound => FaultKind::NotFound,
            ErrorKind::PermissionDenied => FaultKind::PermissionDenied,
            ErrorKind::Interrupted => FaultKind::Interrupted,
            ErrorKind::TimedOut => FaultKind::Timeout,
            _ => FaultKind::Io,
        }
    }
}

impl Fault for crate::core::PersistError {
    fn kind(&self) -> FaultKind {
        match self {
            crate::core::PersistError::Timeout(_) => FaultKind::Timeout,
            _ => FaultKind::App,
        }
    }
}

/// The commit-or-rollback decision for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Commit,
    Rollback,
}

/// Declares which failure kinds force a rollback and which are exempted from
/// that rule. Exactly one decision is made per invocation; when both a
/// rollback clause and an ignore clause match, ignore wins.
#[derive(Debug, Clone)]
pub struct RollbackPolicy {
    rollback_on: Vec<FaultKind>,
    ignore: Vec<FaultKind>,
}

impl RollbackPolicy {
    pub fn new(rollback_on: Vec<FaultKind>, ignore: Vec<FaultKind>) -> Self {
        Self { rollback_on, ignore }
    }

    /// Roll back on the given kinds, ignoring none.
    pub fn rollback_on(kinds: Vec<FaultKind>) -> Self {
        Self::new(kinds, Vec::new())
    }

    /// Add ignore clauses.
    pub fn ignoring(mut self, kinds: Vec<FaultKind>) -> Self {
        self.ignore = kinds;
        self
    }

    /// Decide the transaction outcome for a failure of `kind`.
    pub fn decide(&self, kind: FaultKind) -> TxOutcome {
        for clause in &self.rollback_on {
            if clause.covers(kind) {
                for exemption in &self.ignore {
                    if exemption.covers(kind) {
                        return TxOutcome::Commit;
                    }
                }
                return TxOutcome::Rollback;
            }
        }
        TxOutcome::Commit
    }
}

impl Default for RollbackPolicy {
    /// The process-wide default: every failure rolls back.
    fn default() -> Self {
        Self::rollback_on(vec![FaultKind::Any])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_rolls_back_everything() {
        let policy = RollbackPolicy::default();
        assert_eq!(policy.decide(FaultKind::App), TxOutcome::Rollback);
        assert_eq!(policy.decide(FaultKind::NotFound), TxOutcome::Rollback);
    }

    #[test]
    fn test_ignore_supersedes_rollback() {
        let policy = RollbackPolicy::rollback_on(vec![FaultKind::Io])
            .ignoring(vec![FaultKind::NotFound]);

        // The exempted subtype commits.
        assert_eq!(policy.decide(FaultKind::NotFound), TxOutcome::Commit);
        // A sibling subtype of the rollback clause rolls back.
        assert_eq!(policy.decide(FaultKind::PermissionDenied), TxOutcome::Rollback);
        // An unrelated kind commits.
        assert_eq!(policy.decide(FaultKind::App), TxOutcome::Commit);
    }

    #[test]
    fn test_kind_hierarchy() {
        assert!(FaultKind::Any.covers(FaultKind::App));
        assert!(FaultKind::Io.covers(FaultKind::NotFound));
        assert!(FaultKind::Io.covers(FaultKind::Io));
        assert!(!FaultKind::NotFound.covers(FaultKind::Io));
        assert!(FaultKind::Constraint.covers(FaultKind::UniqueViolation));
        assert!(!FaultKind::Io.covers(FaultKind::UniqueViolation));
    }

    #[test]
    fn test_io_error_classification() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            Fault::kind(&Error::new(ErrorKind::NotFound, "nope")),
            FaultKind::NotFound
        );
        assert_eq!(
            Fault::kind(&Error::new(ErrorKind::BrokenPipe, "pipe")),
            FaultKind::Io
        );
    }
}
