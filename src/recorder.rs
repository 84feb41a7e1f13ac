//! Per-thread dependency recording for automatic dependency capture.
//!
//! Before invoking an evaluator, the engine pushes a frame onto a
//! thread-local stack; any `Observer::get_snapshot` call while a frame is
//! active records the callee into the innermost frame. Frames nest so that
//! constructing an observer during another evaluator's execution keeps the
//! two read sets separate. The stack doubles as the cycle-detection path:
//! a read of a node already on it must not recurse.

use std::cell::RefCell;
use std::sync::Arc;

use crate::node::AnyNode;
use crate::snapshot::{Epoch, NodeId, Version};

/// One dependency read observed during an evaluation.
pub(crate) struct ReadEntry {
    pub(crate) node: Arc<dyn AnyNode>,
    pub(crate) version: Version,
    pub(crate) root_version: Epoch,
}

/// Read set and staleness flag accumulated by one evaluation.
pub(crate) struct FrameResult {
    pub(crate) reads: Vec<ReadEntry>,
    /// Set when a read raced another worker mid-evaluation and had to take
    /// the dependency's previous snapshot. A tainted node is not considered
    /// converged for its epoch, so the dependency's publication re-triggers
    /// it.
    pub(crate) tainted: bool,
}

struct Frame {
    node: NodeId,
    epoch: Epoch,
    reads: Vec<ReadEntry>,
    tainted: bool,
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn enter(node: NodeId, epoch: Epoch) {
    FRAMES.with(|frames| {
        frames.borrow_mut().push(Frame {
            node,
            epoch,
            reads: Vec::new(),
            tainted: false,
        });
    });
}

pub(crate) fn exit() -> FrameResult {
    FRAMES.with(|frames| {
        let frame = frames
            .borrow_mut()
            .pop()
            .expect("evaluation frame missing; enter and exit are paired");
        FrameResult {
            reads: frame.reads,
            tainted: frame.tainted,
        }
    })
}

/// Record a dependency read into the innermost frame, if one is active.
///
/// A repeated read of the same node keeps the latest observed version.
pub(crate) fn record_read(node: &Arc<dyn AnyNode>, version: Version, root_version: Epoch) {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let Some(frame) = frames.last_mut() else {
            return;
        };
        let id = node.common().id;
        if let Some(existing) = frame.reads.iter_mut().find(|r| r.node.common().id == id) {
            existing.version = version;
            existing.root_version = root_version;
        } else {
            frame.reads.push(ReadEntry {
                node: node.clone(),
                version,
                root_version,
            });
        }
    });
}

/// Mark the innermost frame as having observed a mid-evaluation dependency.
pub(crate) fn mark_tainted() {
    FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            frame.tainted = true;
        }
    });
}

/// Epoch of the innermost active frame, if any.
pub(crate) fn active_epoch() -> Option<Epoch> {
    FRAMES.with(|frames| frames.borrow().last().map(|f| f.epoch))
}

pub(crate) fn in_evaluation() -> bool {
    FRAMES.with(|frames| !frames.borrow().is_empty())
}

/// Whether `node` is being evaluated anywhere on this thread's stack.
pub(crate) fn on_evaluation_path(node: NodeId) -> bool {
    FRAMES.with(|frames| frames.borrow().iter().any(|f| f.node == node))
}

pub(crate) fn innermost() -> Option<NodeId> {
    FRAMES.with(|frames| frames.borrow().last().map(|f| f.node))
}

/// Run `f` with the frame stack set aside so its reads are not recorded.
///
/// Used around subscription callbacks and detach hooks, which may read
/// observers without becoming dependencies of whatever evaluation happens
/// to be active on this thread.
pub(crate) fn suppressed<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(Vec<Frame>);

    impl Drop for Restore {
        fn drop(&mut self) {
            FRAMES.with(|frames| frames.borrow_mut().append(&mut self.0));
        }
    }

    let saved = FRAMES.with(|frames| std::mem::take(&mut *frames.borrow_mut()));
    let _restore = Restore(saved);
    f()
}
