//! Calling context carried through a chain of transactional calls.

use crate::error::{CoreError, CoreResult};
use crate::transaction::TransactionHandle;

/// How a transactional call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call returned normally.
    Success,
    /// The call failed; the failure's content is not inspected.
    Failure,
}

impl Outcome {
    /// Classifies a call result.
    pub fn of<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// The explicit context a call chain runs on.
///
/// The dispatch layer creates one context per call chain and hands it to
/// every unit method in that chain, so nested calls into other units locate
/// the caller's transaction without any global lookup.
#[derive(Debug, Default)]
pub struct CallContext {
    current: Option<TransactionHandle>,
    depth: usize,
}

impl CallContext {
    /// Creates a context with no transaction attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transaction attached to this context, if any.
    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionHandle> {
        self.current.clone()
    }

    /// Borrows the attached transaction.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.current.as_ref()
    }

    /// Attaches `handle` to this context.
    ///
    /// Re-attaching the same transaction is a no-op. A finished top-level
    /// transaction is replaced. Fails if a different live transaction is
    /// already attached.
    pub fn attach_transaction(&mut self, handle: TransactionHandle) -> CoreResult<()> {
        self.detach_finished();
        match &self.current {
            Some(existing) if existing.same_transaction(&handle) => Ok(()),
            Some(existing) => Err(CoreError::invalid_operation(format!(
                "context already runs {}, cannot attach {}",
                existing.id(),
                handle.id()
            ))),
            None => {
                self.current = Some(handle);
                Ok(())
            }
        }
    }

    /// Returns the number of transactional calls currently open on this context.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns true if a transaction is attached.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Creates a context for a callee running elsewhere (another mailbox or
    /// thread) that must join this context's transaction.
    ///
    /// The callee starts at the caller's depth, so its own transactional
    /// boundaries never commit or detach the shared transaction.
    #[must_use]
    pub fn propagate(&self) -> Self {
        Self {
            current: self.current.clone(),
            depth: self.depth,
        }
    }

    pub(crate) fn enter(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    pub(crate) fn exit(&mut self) -> CoreResult<usize> {
        if self.depth == 0 {
            return Err(CoreError::invalid_operation(
                "transactional end without matching begin",
            ));
        }
        self.depth -= 1;
        Ok(self.depth)
    }

    pub(crate) fn detach(&mut self) -> Option<TransactionHandle> {
        self.current.take()
    }

    /// Borrows the attached transaction unless it is a top-level one that has
    /// already committed or rolled back.
    pub(crate) fn live_transaction(&self) -> Option<&TransactionHandle> {
        self.current
            .as_ref()
            .filter(|handle| self.depth > 0 || handle.is_active())
    }

    /// Detaches a finished top-level transaction, such as one obtained from
    /// `current` and then committed directly.
    pub(crate) fn detach_finished(&mut self) {
        if self.live_transaction().is_none() {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::types::{SequenceNumber, TransactionId};

    fn handle(id: u64) -> TransactionHandle {
        TransactionHandle::new(Transaction::new(
            TransactionId::new(id),
            SequenceNumber::new(0),
        ))
    }

    #[test]
    fn outcome_of_result() {
        assert_eq!(Outcome::of(&Ok::<_, ()>(1)), Outcome::Success);
        assert_eq!(Outcome::of(&Err::<(), _>("boom")), Outcome::Failure);
    }

    #[test]
    fn attach_same_transaction_twice() {
        let mut ctx = CallContext::new();
        let h = handle(1);
        ctx.attach_transaction(h.clone()).unwrap();
        ctx.attach_transaction(h.clone()).unwrap();
        assert!(ctx.current_transaction().unwrap().same_transaction(&h));
    }

    #[test]
    fn attach_different_transaction_fails() {
        let mut ctx = CallContext::new();
        ctx.attach_transaction(handle(1)).unwrap();
        assert!(ctx.attach_transaction(handle(2)).is_err());
    }

    #[test]
    fn exit_without_enter_fails() {
        let mut ctx = CallContext::new();
        assert!(ctx.exit().is_err());
        assert_eq!(ctx.enter(), 1);
        assert_eq!(ctx.exit().unwrap(), 0);
    }

    #[test]
    fn propagated_context_keeps_depth() {
        let mut ctx = CallContext::new();
        ctx.attach_transaction(handle(1)).unwrap();
        ctx.enter();

        let child = ctx.propagate();
        assert_eq!(child.depth(), 1);
        assert!(child.in_transaction());
    }

    #[test]
    fn finished_top_level_transaction_is_not_live() {
        let mut ctx = CallContext::new();
        let h = handle(1);
        ctx.attach_transaction(h.clone()).unwrap();
        h.lock().mark_committed();
        assert!(ctx.live_transaction().is_none());

        ctx.attach_transaction(handle(2)).unwrap();
        assert_eq!(ctx.transaction().unwrap().id(), TransactionId::new(2));
    }

    #[test]
    fn finished_transaction_stays_attached_while_nested() {
        let mut ctx = CallContext::new();
        let h = handle(1);
        ctx.attach_transaction(h.clone()).unwrap();
        ctx.enter();
        h.lock().mark_aborted("nested failure");

        ctx.detach_finished();
        assert!(ctx.live_transaction().unwrap().same_transaction(&h));
    }
}
