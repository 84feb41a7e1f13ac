//! Externally writable source nodes.
//!
//! Two variants feed the graph from outside: [`Source`] holds a value that
//! callers overwrite with `set`, and [`observe_source`] adapts an external
//! feed that exposes a fetch-plus-change-notification interface.

use std::panic;
use std::sync::{Arc, Weak};

use crate::manager::Manager;
use crate::node::{AnyNode, InitialFailure, Node};
use crate::observer::Observer;

/// An externally writable leaf node.
///
/// `set` publishes asynchronously through the manager: dependents converge
/// once [`wait_for_all_updates`](crate::wait_for_all_updates) returns.
/// Dropping the source keeps existing observers readable; it only removes
/// the ability to write.
pub struct Source<T: Send + Sync + 'static> {
    node: Arc<Node<T>>,
}

impl<T: Send + Sync + 'static> Source<T> {
    /// Create a source holding `initial`.
    pub fn new(initial: T) -> Self {
        let manager = Manager::get();
        let node = Arc::new(Node::new_source());
        node.publish_initial(Arc::new(initial), manager.current_epoch());
        Source { node }
    }

    /// Create a source holding `T::default()`.
    pub fn new_default() -> Self
    where
        T: Default,
    {
        Self::new(T::default())
    }

    /// Publish a new value.
    ///
    /// Non-blocking: the value lands in a pending slot and the node is
    /// enqueued. Rapid calls coalesce, so dependents may observe only the
    /// most recent of a burst, but every dependent sees a version at least
    /// as new as the last `set` once the queue drains.
    pub fn set(&self, value: T) {
        let manager = Manager::get();
        let epoch = manager.advance_epoch();
        self.node.set_pending(Arc::new(value), epoch);
        manager.schedule_refresh(self.node.clone() as Arc<dyn AnyNode>, epoch);
    }

    /// A reader handle onto this source's node.
    pub fn observer(&self) -> Observer<T> {
        Observer::from_node(self.node.clone())
    }
}

impl<T: Send + Sync + Default + 'static> Default for Source<T> {
    fn default() -> Self {
        Self::new_default()
    }
}

/// An external value feed that the engine can poll and subscribe to.
///
/// Implementations bridge configuration files, network registries, or any
/// other out-of-process state into the graph via [`observe_source`].
pub trait ObservableSource: Send + Sync + 'static {
    /// Value produced by the feed.
    type Value: Send + Sync + 'static;

    /// Fetch the current value. May block.
    fn current_value(&self) -> Self::Value;

    /// Install the engine's change-notification hook. Called exactly once,
    /// during construction.
    fn subscribe_for_changes(&self, notifier: ChangeNotifier);

    /// Tear down the subscription. Called exactly once, when the observing
    /// node is destroyed; no `current_value` call can start afterwards.
    fn detach(&self);
}

/// Handle handed to an [`ObservableSource`] for signalling changes.
///
/// Holds the observing node weakly, so firing after the observer is gone is
/// a no-op.
#[derive(Clone)]
pub struct ChangeNotifier {
    node: Weak<dyn AnyNode>,
}

impl ChangeNotifier {
    /// Signal that the external value changed; schedules a re-fetch.
    pub fn notify(&self) {
        if let Some(node) = self.node.upgrade() {
            let manager = Manager::get();
            let epoch = manager.advance_epoch();
            manager.schedule_refresh(node, epoch);
        }
    }
}

/// Observe an external feed through its `{get, subscribe, unsubscribe}`
/// triple.
///
/// Construction fetches once, establishes the subscription, then fetches
/// again so a change firing between the two is not lost. The returned
/// observer owns the feed: dropping the last handle runs `detach`, and an
/// in-flight fetch on a worker keeps the node alive until it returns, so
/// destruction joins it.
///
/// # Panics
///
/// Propagates a panic from the initial `current_value` call.
pub fn observe_source<S: ObservableSource>(source: S) -> Observer<S::Value> {
    let source = Arc::new(source);
    let fetch = source.clone();
    let node = Arc::new(Node::new_eval(
        Box::new(move || Ok(Arc::new(fetch.current_value()))),
        None,
        true,
    ));

    if let Err(failure) = Node::initial_evaluate(&node) {
        match failure {
            InitialFailure::Panicked(payload) => panic::resume_unwind(payload),
            InitialFailure::Nil => unreachable!("poll fetch is infallible at this layer"),
        }
    }
    source.subscribe_for_changes(ChangeNotifier {
        node: {
            let strong: Arc<dyn AnyNode> = node.clone();
            Arc::downgrade(&strong)
        },
    });
    // Only tear down a subscription that was actually established.
    let detach = source.clone();
    node.set_detach(Box::new(move || detach.detach()));
    // Second fetch closes the window where the feed changed after the first
    // fetch but before the subscription existed.
    Node::force_refresh(&node);

    Observer::from_node(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::wait_for_all_updates;

    #[test]
    fn set_keeps_the_latest_value() {
        let source = Source::new(1);
        source.set(2);
        source.set(3);
        wait_for_all_updates();
        assert_eq!(*source.observer().get(), 3);
    }

    #[test]
    fn observers_outlive_the_source() {
        let observer = {
            let source = Source::new("kept".to_string());
            source.observer()
        };
        assert_eq!(*observer.get(), "kept");
    }
}
