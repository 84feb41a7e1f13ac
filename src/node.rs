//! Core node state and the refresh machinery.
//!
//! Every observed value lives in a [`Node`]: the latest published snapshot,
//! the dependency edges discovered by the recorder, weak back-references to
//! dependents, and the run state that serializes evaluation. Dependencies
//! are held strongly and dependents weakly, so a consumer holding an
//! observer keeps its transitive inputs alive while a dropped dependent
//! simply stops being scheduled.

use std::any::Any;
use std::cmp;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::manager::Manager;
use crate::recorder::{self, ReadEntry};
use crate::snapshot::{Epoch, NodeId, Published, Snapshot, Version};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> NodeId {
    NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed) + 1)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "evaluator panicked".to_string()
    }
}

/// The evaluator declined to produce a value.
pub(crate) struct NilValue;

pub(crate) type EvalFn<T> = Box<dyn Fn() -> Result<Arc<T>, NilValue> + Send + Sync>;
pub(crate) type EqFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// How a node obtains its value.
pub(crate) enum Provider<T> {
    /// Set-value source: the latest pending write and the epoch it was made
    /// at. Rapid writes overwrite the slot, which is what coalesces them.
    Pending(Mutex<Option<(Arc<T>, Epoch)>>),
    /// Derived observer or poll source: run the evaluator.
    Eval(EvalFn<T>),
}

/// Run state serializing evaluation of a single node.
enum RunState {
    Idle,
    Queued { epoch: Epoch },
    Evaluating { queued_again: Option<Epoch> },
}

/// Whether a schedule request needs a queue entry or coalesced into an
/// existing one.
pub(crate) enum ScheduleDecision {
    Push,
    Coalesced,
}

/// Why a first evaluation did not publish, reported to the constructor.
pub(crate) enum InitialFailure {
    Nil,
    Panicked(Box<dyn Any + Send>),
}

pub(crate) struct DependencyEdge {
    node: Arc<dyn AnyNode>,
    version_seen: Version,
}

/// Shared, type-independent node state.
pub(crate) struct NodeCommon {
    pub(crate) id: NodeId,
    state: Mutex<RunState>,
    /// Highest epoch this node has converged for.
    refreshed_epoch: AtomicU64,
    dependencies: Mutex<Vec<DependencyEdge>>,
    /// Weak back-references from dependency to dependent, pruned when an
    /// upgrade fails during propagation.
    dependents: papaya::HashMap<NodeId, Weak<dyn AnyNode>, ahash::RandomState>,
    failures: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl NodeCommon {
    fn new() -> Self {
        NodeCommon {
            id: next_node_id(),
            state: Mutex::new(RunState::Idle),
            refreshed_epoch: AtomicU64::new(0),
            dependencies: Mutex::new(Vec::new()),
            dependents: papaya::HashMap::with_hasher(ahash::RandomState::new()),
            failures: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub(crate) fn refreshed_epoch(&self) -> Epoch {
        Epoch(self.refreshed_epoch.load(Ordering::Acquire))
    }

    fn bump_refreshed(&self, epoch: Epoch) {
        self.refreshed_epoch.fetch_max(epoch.0, Ordering::AcqRel);
    }

    /// Register interest in a refresh at `epoch`. The caller pushes a queue
    /// entry only for [`ScheduleDecision::Push`]; later requests collapse
    /// into the pending one, which makes enqueueing idempotent.
    pub(crate) fn note_scheduled(&self, epoch: Epoch) -> ScheduleDecision {
        let mut state = self.state.lock();
        match &mut *state {
            RunState::Idle => {
                *state = RunState::Queued { epoch };
                ScheduleDecision::Push
            }
            RunState::Queued { epoch: pending } => {
                *pending = cmp::max(*pending, epoch);
                ScheduleDecision::Coalesced
            }
            RunState::Evaluating { queued_again } => {
                *queued_again = Some(queued_again.map_or(epoch, |q| cmp::max(q, epoch)));
                ScheduleDecision::Coalesced
            }
        }
    }
}

/// Object-safe view of a node used by the scheduler and the recorder.
pub(crate) trait AnyNode: Send + Sync + 'static {
    fn common(&self) -> &NodeCommon;

    /// Bring the node up to date for `epoch`, evaluating inline if needed.
    ///
    /// This is the pull entry point used by reads inside evaluators and by
    /// construction; the cycle-breaking rules live here.
    fn refresh(self: Arc<Self>, epoch: Epoch);

    /// Queue entry point: refresh at the epoch recorded in the run state.
    fn refresh_from_queue(self: Arc<Self>);

    /// Version of the latest publication, if any.
    fn published_version(&self) -> Option<Version>;
}

struct CallbackEntry<T> {
    id: u64,
    callback: Arc<dyn Fn(Snapshot<T>) + Send + Sync>,
    /// Highest version delivered to this callback; keeps deliveries
    /// monotone when the immediate first invocation races a publication.
    delivered: Arc<AtomicU64>,
}

impl<T> Clone for CallbackEntry<T> {
    fn clone(&self) -> Self {
        CallbackEntry {
            id: self.id,
            callback: self.callback.clone(),
            delivered: self.delivered.clone(),
        }
    }
}

/// A typed node: the common graph state plus the value machinery.
pub(crate) struct Node<T: Send + Sync + 'static> {
    common: NodeCommon,
    provider: Provider<T>,
    published: ArcSwapOption<Published<T>>,
    next_version: AtomicU64,
    callbacks: Mutex<Vec<CallbackEntry<T>>>,
    next_callback: AtomicU64,
    value_eq: Option<EqFn<T>>,
    /// Poll sources fetch on every refresh even with no recorded deps.
    always_evaluate: bool,
    on_detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T: Send + Sync + 'static> Node<T> {
    pub(crate) fn new_source() -> Self {
        Node {
            common: NodeCommon::new(),
            provider: Provider::Pending(Mutex::new(None)),
            published: ArcSwapOption::new(None),
            next_version: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(0),
            value_eq: None,
            always_evaluate: false,
            on_detach: Mutex::new(None),
        }
    }

    pub(crate) fn new_eval(
        eval: EvalFn<T>,
        value_eq: Option<EqFn<T>>,
        always_evaluate: bool,
    ) -> Self {
        Node {
            common: NodeCommon::new(),
            provider: Provider::Eval(eval),
            published: ArcSwapOption::new(None),
            next_version: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(0),
            value_eq,
            always_evaluate,
            on_detach: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.common.id
    }

    pub(crate) fn set_detach(&self, detach: Box<dyn FnOnce() + Send>) {
        *self.on_detach.lock() = Some(detach);
    }

    pub(crate) fn load(&self) -> Option<Snapshot<T>> {
        self.published
            .load_full()
            .map(|published| Snapshot::new(published, self.common.id))
    }

    pub(crate) fn snapshot(&self) -> Snapshot<T> {
        self.load()
            .expect("node has no published snapshot; constructors publish before sharing")
    }

    /// Snapshot read for observer handles: inside an evaluation it first
    /// pulls the node up to the frame's epoch and records the dependency;
    /// outside it is a plain wait-free load.
    pub(crate) fn observed_snapshot(this: &Arc<Self>) -> Snapshot<T> {
        if let Some(epoch) = recorder::active_epoch() {
            let node: Arc<dyn AnyNode> = this.clone();
            node.clone().refresh(epoch);
            let snapshot = this.snapshot();
            recorder::record_read(&node, snapshot.version(), snapshot.root_version());
            snapshot
        } else {
            this.snapshot()
        }
    }

    /// Seed a source node's first snapshot before the node is shared.
    pub(crate) fn publish_initial(&self, value: Arc<T>, epoch: Epoch) {
        self.common.bump_refreshed(epoch);
        self.publish(value, epoch);
    }

    /// Store a pending source write; the queue publishes it. Concurrent
    /// writers are ordered by epoch, so a stale racer never clobbers a
    /// newer pending value.
    pub(crate) fn set_pending(&self, value: Arc<T>, epoch: Epoch) {
        match &self.provider {
            Provider::Pending(slot) => {
                let mut slot = slot.lock();
                if slot.as_ref().map_or(true, |(_, pending)| *pending < epoch) {
                    *slot = Some((value, epoch));
                }
            }
            Provider::Eval(_) => unreachable!("set is only exposed on set-value sources"),
        }
    }

    pub(crate) fn failure_count(&self) -> u64 {
        self.common.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn last_failure_message(&self) -> Option<String> {
        self.common.last_failure.lock().clone()
    }

    pub(crate) fn dependency_ids(&self) -> Vec<NodeId> {
        self.common
            .dependencies
            .lock()
            .iter()
            .map(|edge| edge.node.common().id)
            .collect()
    }

    pub(crate) fn add_callback(&self, callback: Arc<dyn Fn(Snapshot<T>) + Send + Sync>) -> u64 {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = CallbackEntry {
            id,
            callback,
            delivered: Arc::new(AtomicU64::new(0)),
        };
        self.callbacks.lock().push(entry.clone());
        // Immediate first delivery with the current value.
        let snapshot = self.snapshot();
        recorder::suppressed(|| self.deliver_to(&entry, snapshot));
        id
    }

    pub(crate) fn remove_callback(&self, id: u64) {
        self.callbacks.lock().retain(|entry| entry.id != id);
    }

    #[cfg(test)]
    fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Synchronous first evaluation, run by constructors before the node is
    /// shared. Failures are reported instead of swallowed so construction
    /// can fail.
    pub(crate) fn initial_evaluate(this: &Arc<Self>) -> Result<(), InitialFailure> {
        let manager = Manager::get();
        let epoch = manager.current_epoch();
        {
            let mut state = this.common.state.lock();
            debug_assert!(matches!(*state, RunState::Idle));
            *state = RunState::Evaluating { queued_again: None };
        }
        let Provider::Eval(eval) = &this.provider else {
            unreachable!("initial evaluation is only performed for evaluator-backed nodes")
        };
        recorder::enter(this.common.id, epoch);
        let result = panic::catch_unwind(AssertUnwindSafe(|| eval()));
        let frame = recorder::exit();
        let outcome = match result {
            Ok(Ok(value)) => {
                let root = frame
                    .reads
                    .iter()
                    .map(|read| read.root_version)
                    .max()
                    .unwrap_or_default();
                Self::swap_dependencies(this, frame.reads);
                if !frame.tainted {
                    this.common.bump_refreshed(epoch);
                }
                this.publish(value, root);
                Ok(())
            }
            Ok(Err(NilValue)) => Err(InitialFailure::Nil),
            Err(payload) => Err(InitialFailure::Panicked(payload)),
        };
        Self::complete(this);
        if outcome.is_ok() && !this.deps_unchanged() {
            // A dependency published between our read and the back-link
            // installation; catch up through the queue.
            manager.schedule_refresh(this.clone() as Arc<dyn AnyNode>, manager.advance_epoch());
        }
        outcome
    }

    /// Unconditional re-evaluation, bypassing the epoch gate. Used by poll
    /// sources to close the fetch/subscribe race at construction.
    pub(crate) fn force_refresh(this: &Arc<Self>) {
        let epoch = Manager::get().current_epoch();
        let target = {
            let mut state = this.common.state.lock();
            match &mut *state {
                RunState::Evaluating { queued_again } => {
                    *queued_again = Some(queued_again.map_or(epoch, |q| cmp::max(q, epoch)));
                    return;
                }
                RunState::Queued { epoch: pending } => {
                    let target = cmp::max(*pending, epoch);
                    *state = RunState::Evaluating { queued_again: None };
                    target
                }
                RunState::Idle => {
                    *state = RunState::Evaluating { queued_again: None };
                    epoch
                }
            }
        };
        Self::run_refresh(this, target);
        Self::complete(this);
    }

    /// Evaluate (or take the pending write) and publish. The caller owns
    /// the `Evaluating` state.
    fn run_refresh(this: &Arc<Self>, epoch: Epoch) {
        match &this.provider {
            Provider::Pending(slot) => {
                let taken = slot.lock().take();
                if let Some((value, at)) = taken {
                    this.common.bump_refreshed(cmp::max(epoch, at));
                    if let Some(root) = this.publish(value, at) {
                        this.propagate(cmp::max(epoch, root));
                    }
                } else {
                    this.common.bump_refreshed(epoch);
                }
            }
            Provider::Eval(eval) => {
                if !this.always_evaluate
                    && this.published.load().is_some()
                    && this.deps_unchanged()
                {
                    // Nothing this node read has republished; converged.
                    this.common.bump_refreshed(epoch);
                    return;
                }
                recorder::enter(this.common.id, epoch);
                let result = panic::catch_unwind(AssertUnwindSafe(|| eval()));
                let frame = recorder::exit();
                match result {
                    Ok(Ok(value)) => {
                        let mut root = frame
                            .reads
                            .iter()
                            .map(|read| read.root_version)
                            .max()
                            .unwrap_or_default();
                        if this.always_evaluate {
                            // Poll sources are roots: stamp the epoch that
                            // triggered this fetch.
                            root = cmp::max(root, epoch);
                        }
                        Self::swap_dependencies(this, frame.reads);
                        if !frame.tainted {
                            this.common.bump_refreshed(epoch);
                        }
                        if let Some(root) = this.publish(value, root) {
                            this.propagate(cmp::max(epoch, root));
                        }
                    }
                    Ok(Err(NilValue)) => this.note_failure("evaluator returned no value".into()),
                    Err(payload) => this.note_failure(panic_message(payload.as_ref())),
                }
            }
        }
    }

    fn note_failure(&self, message: String) {
        self.common.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            node = self.common.id.0,
            %message,
            "evaluation failed; keeping prior snapshot"
        );
        *self.common.last_failure.lock() = Some(message);
    }

    /// Publish a new snapshot unless the equality suppressor rejects it.
    /// Returns the published root version.
    fn publish(&self, value: Arc<T>, root: Epoch) -> Option<Epoch> {
        let previous = self.published.load_full();
        if let (Some(previous), Some(value_eq)) = (&previous, &self.value_eq) {
            if value_eq(&previous.value, &value) {
                return None;
            }
        }
        let version = Version(self.next_version.fetch_add(1, Ordering::SeqCst) + 1);
        let root = cmp::max(root, previous.map(|p| p.root_version).unwrap_or_default());
        let published = Arc::new(Published {
            value,
            version,
            root_version: root,
        });
        self.published.store(Some(published.clone()));
        self.deliver(&published);
        Some(root)
    }

    fn deliver(&self, published: &Arc<Published<T>>) {
        let entries = self.callbacks.lock().clone();
        if entries.is_empty() {
            return;
        }
        recorder::suppressed(|| {
            for entry in &entries {
                let snapshot = Snapshot::new(published.clone(), self.common.id);
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| self.deliver_to(entry, snapshot)))
                {
                    tracing::error!(
                        node = self.common.id.0,
                        message = panic_message(payload.as_ref()),
                        "subscription callback panicked"
                    );
                }
            }
        });
    }

    fn deliver_to(&self, entry: &CallbackEntry<T>, snapshot: Snapshot<T>) {
        let version = snapshot.version().0;
        if entry.delivered.fetch_max(version, Ordering::SeqCst) < version {
            (entry.callback)(snapshot);
        }
    }

    /// Install the read set of a successful evaluation and fix back-links:
    /// newly read nodes gain this node as a dependent, dropped ones lose it.
    fn swap_dependencies(this: &Arc<Self>, reads: Vec<ReadEntry>) {
        let weak = {
            let strong: Arc<dyn AnyNode> = this.clone();
            Arc::downgrade(&strong)
        };
        let mut dependencies = this.common.dependencies.lock();
        for old in dependencies.iter() {
            let old_id = old.node.common().id;
            if !reads.iter().any(|read| read.node.common().id == old_id) {
                old.node.common().dependents.pin().remove(&this.common.id);
            }
        }
        for read in &reads {
            let read_id = read.node.common().id;
            if !dependencies
                .iter()
                .any(|edge| edge.node.common().id == read_id)
            {
                read.node
                    .common()
                    .dependents
                    .pin()
                    .insert(this.common.id, weak.clone());
            }
        }
        *dependencies = reads
            .into_iter()
            .map(|read| DependencyEdge {
                node: read.node,
                version_seen: read.version,
            })
            .collect();
    }

    /// True when every recorded dependency still sits at the version this
    /// node last read. The basis for evaluating at most once per epoch.
    fn deps_unchanged(&self) -> bool {
        let dependencies = self.common.dependencies.lock();
        dependencies
            .iter()
            .all(|edge| edge.node.published_version() == Some(edge.version_seen))
    }

    fn propagate(&self, epoch: Epoch) {
        let manager = Manager::get();
        let dependents = self.common.dependents.pin();
        let mut dead = Vec::new();
        for (id, weak) in dependents.iter() {
            match weak.upgrade() {
                Some(node) => manager.schedule_refresh(node, epoch),
                None => dead.push(*id),
            }
        }
        for id in dead {
            dependents.remove(&id);
        }
    }

    /// Leave the `Evaluating` state, re-enqueueing when a newer refresh was
    /// requested mid-evaluation.
    fn complete(this: &Arc<Self>) {
        let requeue = {
            let mut state = this.common.state.lock();
            match &mut *state {
                RunState::Evaluating { queued_again } => match queued_again.take() {
                    Some(epoch) if epoch > this.common.refreshed_epoch() => {
                        *state = RunState::Queued { epoch };
                        true
                    }
                    _ => {
                        *state = RunState::Idle;
                        false
                    }
                },
                _ => unreachable!("run state is owned by the evaluating thread"),
            }
        };
        if requeue {
            Manager::get().push_refresh(this.clone() as Arc<dyn AnyNode>);
        }
    }
}

impl<T: Send + Sync + 'static> AnyNode for Node<T> {
    fn common(&self) -> &NodeCommon {
        &self.common
    }

    fn refresh(self: Arc<Self>, epoch: Epoch) {
        if self.common.refreshed_epoch() >= epoch {
            return;
        }
        // Cycle rule: a node already evaluating on this thread's path keeps
        // its previous snapshot for this read.
        if recorder::on_evaluation_path(self.common.id) {
            return;
        }
        let target = {
            let mut state = self.common.state.lock();
            match &mut *state {
                RunState::Evaluating { queued_again } => {
                    // Another thread is mid-evaluation. Don't block: take
                    // the current snapshot, ask for a re-run, and flag the
                    // reader so the publication re-triggers it.
                    *queued_again = Some(queued_again.map_or(epoch, |q| cmp::max(q, epoch)));
                    if recorder::in_evaluation() {
                        recorder::mark_tainted();
                    }
                    return;
                }
                RunState::Queued { epoch: pending } => {
                    let target = cmp::max(*pending, epoch);
                    *state = RunState::Evaluating { queued_again: None };
                    target
                }
                RunState::Idle => {
                    *state = RunState::Evaluating { queued_again: None };
                    epoch
                }
            }
        };
        if self.common.refreshed_epoch() < target {
            Self::run_refresh(&self, target);
        }
        Self::complete(&self);
    }

    fn refresh_from_queue(self: Arc<Self>) {
        let target = {
            let mut state = self.common.state.lock();
            match &mut *state {
                RunState::Queued { epoch } => {
                    let target = *epoch;
                    *state = RunState::Evaluating { queued_again: None };
                    target
                }
                // A pull already claimed this queue entry.
                _ => return,
            }
        };
        if self.common.refreshed_epoch() < target {
            Self::run_refresh(&self, target);
        }
        Self::complete(&self);
    }

    fn published_version(&self) -> Option<Version> {
        self.published.load().as_ref().map(|p| p.version)
    }
}

impl<T: Send + Sync + 'static> Drop for Node<T> {
    fn drop(&mut self) {
        let dependencies = std::mem::take(self.common.dependencies.get_mut());
        for edge in dependencies {
            edge.node.common().dependents.pin().remove(&self.common.id);
        }
        if let Some(detach) = self.on_detach.get_mut().take() {
            recorder::suppressed(detach);
        }
    }
}
