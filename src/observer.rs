//! Derived observers and subscription callbacks.

use std::panic;
use std::sync::Arc;

use crate::error::Error;
use crate::node::{panic_message, EqFn, EvalFn, InitialFailure, Node, NilValue};
use crate::snapshot::{NodeId, Snapshot};

/// A reader handle onto one node of the graph.
///
/// Cloning is cheap and shares the node. An observer read from inside an
/// evaluator is recorded as a dependency of the evaluating node; reads from
/// any other thread are plain wait-free snapshot loads.
pub struct Observer<T: Send + Sync + 'static> {
    node: Arc<Node<T>>,
}

impl<T: Send + Sync + 'static> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Observer {
            node: self.node.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Observer<T> {
    pub(crate) fn from_node(node: Arc<Node<T>>) -> Self {
        Observer { node }
    }

    pub(crate) fn construct(
        eval: EvalFn<T>,
        value_eq: Option<EqFn<T>>,
    ) -> Result<Observer<T>, InitialFailure> {
        let node = Arc::new(Node::new_eval(eval, value_eq, false));
        Node::initial_evaluate(&node)?;
        Ok(Observer { node })
    }

    /// The node's current snapshot.
    pub fn get_snapshot(&self) -> Snapshot<T> {
        Node::observed_snapshot(&self.node)
    }

    /// Shared handle to the current value; shorthand for
    /// `get_snapshot().value()`.
    pub fn get(&self) -> Arc<T> {
        self.get_snapshot().value()
    }

    /// Stable identity of the underlying node.
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Ids of the nodes read by the last successful evaluation.
    ///
    /// Diagnostic; empty for source and static observers.
    pub fn dependency_ids(&self) -> Vec<NodeId> {
        self.node.dependency_ids()
    }

    /// Number of evaluations that failed since construction. Diagnostic.
    pub fn failure_count(&self) -> u64 {
        self.node.failure_count()
    }

    /// The most recent evaluation failure, if any. Diagnostic.
    pub fn last_failure(&self) -> Option<Error> {
        self.node
            .last_failure_message()
            .map(|message| Error::EvaluationFailure { message })
    }

    /// Register `callback` to run with every newly published snapshot, plus
    /// once immediately with the current one.
    ///
    /// The callback runs on update workers. Per-handle deliveries are
    /// version-monotone; ordering across different callbacks on one node is
    /// registration order but not contractual. The subscription lives as
    /// long as the returned handle.
    pub fn add_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Snapshot<T>) + Send + Sync + 'static,
    {
        let id = self.node.add_callback(Arc::new(callback));
        let node = Arc::downgrade(&self.node);
        CallbackHandle {
            cancel: Some(Box::new(move || {
                if let Some(node) = node.upgrade() {
                    node.remove_callback(id);
                }
            })),
        }
    }
}

/// Registration handle returned by [`Observer::add_callback`].
///
/// Dropping the handle cancels the subscription, so reassigning a handle
/// variable releases the previous callback rather than leaking it.
pub struct CallbackHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CallbackHandle {
    /// Unregister the callback.
    ///
    /// No invocation starts after this returns; an invocation already
    /// running on a worker may still complete, so callers must tolerate one
    /// final concurrent delivery. Safe to call from inside the callback
    /// itself.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Create a derived observer from a pure evaluator.
///
/// The evaluator may read any other observers; those reads become the
/// node's dependencies and are re-recorded on every evaluation. The initial
/// evaluation runs synchronously, so the observer has a defined value from
/// birth. The evaluator must be callable from any worker thread at
/// arbitrary times.
///
/// # Panics
///
/// A panic in the initial evaluation propagates to the caller. Panics in
/// later re-evaluations are caught by the engine: the node keeps its prior
/// snapshot and retries on the next update.
pub fn make_observer<T, F>(evaluator: F) -> Observer<T>
where
    T: Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    let eval: EvalFn<T> = Box::new(move || Ok(Arc::new(evaluator())));
    match Observer::construct(eval, None) {
        Ok(observer) => observer,
        Err(InitialFailure::Panicked(payload)) => panic::resume_unwind(payload),
        Err(InitialFailure::Nil) => unreachable!("infallible evaluator cannot return nil"),
    }
}

/// Create a derived observer from an evaluator that may decline to produce
/// a value.
///
/// # Errors
///
/// - [`Error::NilResult`] when the first evaluation returns `None`.
/// - [`Error::InitialEvaluationFailure`] when the first evaluation panics.
///
/// A `None` from a later re-evaluation keeps the prior snapshot and counts
/// as an evaluation failure, without notifying dependents.
pub fn try_make_observer<T, F>(evaluator: F) -> Result<Observer<T>, Error>
where
    T: Send + Sync + 'static,
    F: Fn() -> Option<T> + Send + Sync + 'static,
{
    let eval: EvalFn<T> = Box::new(move || evaluator().map(Arc::new).ok_or(NilValue));
    Observer::construct(eval, None).map_err(|failure| match failure {
        InitialFailure::Nil => Error::NilResult,
        InitialFailure::Panicked(payload) => Error::InitialEvaluationFailure {
            message: panic_message(payload.as_ref()),
        },
    })
}

/// Constant observer: publishes `value` once and has no dependencies.
pub fn make_static_observer<T>(value: T) -> Observer<T>
where
    T: Send + Sync + 'static,
{
    let value = Arc::new(value);
    let eval: EvalFn<T> = Box::new(move || Ok(value.clone()));
    match Observer::construct(eval, None) {
        Ok(observer) => observer,
        Err(_) => unreachable!("constant evaluator cannot fail"),
    }
}

/// Flatten an observer whose value is itself an observer.
///
/// The result tracks both layers: it re-evaluates when the outer selection
/// changes and when the currently selected inner observer publishes.
pub fn unwrap_observer<T>(observer: Observer<Observer<T>>) -> Observer<T>
where
    T: Send + Sync + 'static,
{
    let eval: EvalFn<T> = Box::new(move || {
        let inner = observer.get_snapshot();
        Ok(inner.get_snapshot().value())
    });
    match Observer::construct(eval, None) {
        Ok(observer) => observer,
        Err(InitialFailure::Panicked(payload)) => panic::resume_unwind(payload),
        Err(InitialFailure::Nil) => unreachable!("unwrap evaluator cannot return nil"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::wait_for_all_updates;
    use crate::source::Source;

    #[test]
    fn derived_observers_have_a_value_from_birth() {
        let observer = make_observer(|| 7);
        assert_eq!(*observer.get(), 7);
        assert_eq!(observer.failure_count(), 0);
        assert!(observer.last_failure().is_none());
        assert!(observer.dependency_ids().is_empty());
    }

    #[test]
    fn static_observers_hold_their_value() {
        let fixed = make_static_observer(vec![1, 2, 3]);
        assert_eq!(*fixed.get(), vec![1, 2, 3]);
    }

    #[test]
    fn snapshots_carry_node_identity() {
        let observer = make_observer(|| 1);
        let snapshot = observer.get_snapshot();
        assert_eq!(snapshot.node(), observer.id());
    }

    #[test]
    fn reads_become_dependencies() {
        let source = Source::new(10);
        let source_id = source.observer().id();
        let doubled = {
            let input = source.observer();
            make_observer(move || *input.get() * 2)
        };
        assert_eq!(*doubled.get(), 20);
        assert_eq!(doubled.dependency_ids(), vec![source_id]);

        source.set(11);
        wait_for_all_updates();
        assert_eq!(*doubled.get(), 22);
    }
}
