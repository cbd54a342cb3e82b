// ============================================================================
// Transferable Work Item
// ============================================================================

use crate::context::{CallContext, ContextSnapshot, ContextValue, STARTED_ON_THIS_THREAD};
use std::panic::Location;
use tracing::error;

/// Packages a unit of callable work so it can run later, possibly on another
/// thread, optionally carrying a snapshot of the submitter's scoped context
/// and the transaction-ownership flag read by the interceptor.
///
/// A work item is consumed exactly once: `run()` takes `self` by value, and
/// the wrapped closure and snapshot are dropped on every exit path. The
/// submission site is captured at construction and logged when the work
/// fails, since the failure otherwise surfaces far from where the item was
/// created.
pub struct WorkItem<T, E> {
    work: Box<dyn FnOnce(&CallContext) -> Result<T, E> + Send>,
    snapshot: Option<ContextSnapshot>,
    submitted_at: &'static Location<'static>,
}

impl<T, E: std::fmt::Display> WorkItem<T, E> {
    /// Wrap `work` with no context transfer: it runs in whatever scope is
    /// active at execution time.
    #[track_caller]
    pub fn of(work: impl FnOnce(&CallContext) -> Result<T, E> + Send + 'static) -> Self {
        Self {
            work: Box::new(work),
            snapshot: None,
            submitted_at: Location::caller(),
        }
    }

    /// Wrap `work` and capture the submitter's context for restoration at
    /// execution time.
    #[track_caller]
    pub fn of_scoped(
        work: impl FnOnce(&CallContext) -> Result<T, E> + Send + 'static,
        ctx: &CallContext,
    ) -> Self {
        Self {
            work: Box::new(work),
            snapshot: Some(ctx.snapshot()),
            submitted_at: Location::caller(),
        }
    }

    /// Wrap `work`, capture the submitter's context, and record whether the
    /// transaction is being transferred in (`transfer_transaction = true`) or
    /// will be started by the destination thread.
    ///
    /// The flag lands in the snapshot under [`STARTED_ON_THIS_THREAD`]: the
    /// interceptor uses it to decide whether the destination invocation must
    /// begin a new unit of work or must find one already active.
    #[track_caller]
    pub fn of_transactional(
        work: impl FnOnce(&CallContext) -> Result<T, E> + Send + 'static,
        ctx: &CallContext,
        transfer_transaction: bool,
    ) -> Self {
        let mut snapshot = ctx.snapshot();
        snapshot.values.insert(
            STARTED_ON_THIS_THREAD.to_string(),
            ContextValue::Bool(!transfer_transaction),
        );
        Self {
            work: Box::new(work),
            snapshot: Some(snapshot),
            submitted_at: Location::caller(),
        }
    }

    /// Execute the wrapped work on the given context.
    ///
    /// When a snapshot is present it is fully restored and the scope entered
    /// *before* the work reads or writes any scoped state; the scope is
    /// exited on every exit path. The work's error is returned unchanged.
    pub fn run(self, ctx: &CallContext) -> Result<T, E> {
        let WorkItem {
            work,
            snapshot,
            submitted_at,
        } = self;

        let transferred = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            ctx.restore(snapshot);
            ctx.enter();
        }

        let result = (work)(ctx);

        if transferred {
            ctx.exit();
        }
        if let Err(e) = &result {
            error!(submitted_at = %submitted_at, error = %e, "transferable work failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextValue;

    #[test]
    fn test_plain_item_runs_in_ambient_scope() {
        let ctx = CallContext::new();
        ctx.enter();
        ctx.put("k", ContextValue::Str("ambient".into())).unwrap();

        let item: WorkItem<String, String> = WorkItem::of(|ctx| match ctx.get("k") {
            Some(ContextValue::Str(s)) => Ok(s),
            _ => Err("missing".to_string()),
        });
        assert_eq!(item.run(&ctx).unwrap(), "ambient");
        ctx.exit();
    }

    #[test]
    fn test_scoped_item_restores_snapshot_on_other_thread() {
        let source = CallContext::new();
        source.enter();
        source.put("k", ContextValue::Str("carried".into())).unwrap();

        let item: WorkItem<String, String> =
            WorkItem::of_scoped(
                |ctx| match ctx.get("k") {
                    Some(ContextValue::Str(s)) => Ok(s),
                    _ => Err("missing".to_string()),
                },
                &source,
            );
        source.exit();

        let handle = std::thread::spawn(move || {
            let dest = CallContext::new();
            item.run(&dest)
        });
        assert_eq!(handle.join().unwrap().unwrap(), "carried");
    }

    #[test]
    fn test_transactional_item_records_ownership_flag() {
        let source = CallContext::new();
        source.enter();

        let transferred: WorkItem<bool, String> = WorkItem::of_transactional(
            |ctx| Ok(ctx.get_bool(STARTED_ON_THIS_THREAD).unwrap()),
            &source,
            true,
        );
        let started_here: WorkItem<bool, String> = WorkItem::of_transactional(
            |ctx| Ok(ctx.get_bool(STARTED_ON_THIS_THREAD).unwrap()),
            &source,
            false,
        );
        source.exit();

        let dest = CallContext::new();
        assert!(!transferred.run(&dest).unwrap());
        let dest2 = CallContext::new();
        assert!(started_here.run(&dest2).unwrap());
    }

    #[test]
    fn test_scope_exits_on_failure() {
        let source = CallContext::new();
        source.enter();
        let item: WorkItem<(), String> =
            WorkItem::of_scoped(|_| Err("boom".to_string()), &source);
        source.exit();

        let dest = CallContext::new();
        assert_eq!(item.run(&dest).unwrap_err(), "boom");
        assert!(!dest.is_started());
    }
}
