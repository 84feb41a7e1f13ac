//! Process-wide update scheduler.
//!
//! Exactly one manager exists per process, lazily started on first use. It
//! owns the dirty queue, a fixed pool of worker threads that drain it, the
//! global update epoch, and the quiescence barrier behind
//! [`wait_for_all_updates`].

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::node::{AnyNode, ScheduleDecision};
use crate::recorder;
use crate::snapshot::{Epoch, NodeId};
use crate::Error;

enum Task {
    Refresh { node: Arc<dyn AnyNode> },
    Run(Box<dyn FnOnce() + Send>),
}

pub(crate) struct Manager {
    queue: Mutex<VecDeque<Task>>,
    queue_ready: Condvar,
    epoch: AtomicU64,
    /// Queued tasks plus tasks currently running on a worker.
    in_flight: Mutex<usize>,
    quiescent: Condvar,
}

static MANAGER: Lazy<Manager> = Lazy::new(Manager::start);

impl Manager {
    pub(crate) fn get() -> &'static Manager {
        &MANAGER
    }

    fn start() -> Manager {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        for index in 0..workers {
            thread::Builder::new()
                .name(format!("signal-flow-{index}"))
                .spawn(Self::worker_loop)
                .expect("failed to spawn update worker");
        }
        tracing::debug!(workers, "update manager started");
        Manager {
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Condvar::new(),
            epoch: AtomicU64::new(0),
            in_flight: Mutex::new(0),
            quiescent: Condvar::new(),
        }
    }

    fn worker_loop() {
        // Blocks until the lazy initializer finishes when a worker starts
        // faster than the manager that spawned it.
        let manager = Manager::get();
        loop {
            let task = {
                let mut queue = manager.queue.lock();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    manager.queue_ready.wait(&mut queue);
                }
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || match task {
                Task::Refresh { node } => node.refresh_from_queue(),
                Task::Run(run) => run(),
            }));
            if outcome.is_err() {
                tracing::error!("update task panicked");
            }
            manager.task_done();
        }
    }

    fn task_done(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.quiescent.notify_all();
        }
    }

    fn push(&self, task: Task) {
        *self.in_flight.lock() += 1;
        self.queue.lock().push_back(task);
        self.queue_ready.notify_one();
    }

    pub(crate) fn push_refresh(&self, node: Arc<dyn AnyNode>) {
        self.push(Task::Refresh { node });
    }

    /// Enqueue `node` for a refresh at `epoch`. Idempotent: requests for an
    /// already-queued or currently-evaluating node collapse into it.
    pub(crate) fn schedule_refresh(&self, node: Arc<dyn AnyNode>, epoch: Epoch) {
        if node.common().refreshed_epoch() >= epoch {
            return;
        }
        if let ScheduleDecision::Push = node.common().note_scheduled(epoch) {
            tracing::trace!(node = node.common().id.0, epoch = epoch.0, "node enqueued");
            self.push(Task::Refresh { node });
        }
    }

    pub(crate) fn advance_epoch(&self) -> Epoch {
        Epoch(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn current_epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::SeqCst))
    }
}

/// Block until the dirty queue is empty and no worker is evaluating.
///
/// Every `set` issued before this call is reflected in all transitive
/// dependents once it returns.
///
/// # Panics
///
/// Panics when called from inside an evaluator, which would deadlock the
/// worker pool. Use [`try_wait_for_all_updates`] to get an error instead.
pub fn wait_for_all_updates() {
    if let Err(error) = try_wait_for_all_updates() {
        panic!("{error}");
    }
}

/// Non-panicking variant of [`wait_for_all_updates`].
///
/// # Errors
///
/// Returns [`Error::QuiescenceFromEvaluator`] when called from inside an
/// evaluator.
pub fn try_wait_for_all_updates() -> Result<(), Error> {
    if recorder::in_evaluation() {
        return Err(Error::QuiescenceFromEvaluator);
    }
    let manager = Manager::get();
    let mut in_flight = manager.in_flight.lock();
    while *in_flight > 0 {
        manager.quiescent.wait(&mut in_flight);
    }
    Ok(())
}

/// Schedule a one-shot task on an update worker.
///
/// The task runs when its worker is not evaluating any node, which makes it
/// a safe place for side effects that need to read other observers (for
/// example from destructors).
pub fn run_on_manager_thread<F>(task: F)
where
    F: FnOnce() + Send + 'static,
{
    Manager::get().push(Task::Run(Box::new(task)));
}

/// Identity of the node whose evaluator is running on this thread, if any.
pub fn currently_evaluating() -> Option<NodeId> {
    recorder::innermost()
}
