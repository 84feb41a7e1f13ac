//! Snapshot and version metadata types.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// NodeId is a process-unique, stable identifier for a node in the
/// dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u64);

/// Version is a per-node monotonically increasing number, bumped every time
/// the node publishes a new value.
///
/// Versions are not comparable across different nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(pub u64);

/// Epoch is the global update counter; every top-level source mutation
/// advances it.
///
/// A snapshot's root version is the highest epoch that contributed to its
/// value, tying a derived value back to the latest source update it
/// incorporates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Epoch(pub u64);

/// One publication of a node: the shared value plus its version metadata.
pub(crate) struct Published<T> {
    pub(crate) value: Arc<T>,
    pub(crate) version: Version,
    pub(crate) root_version: Epoch,
}

/// Snapshot is an immutable, cheaply cloneable handle to one published value
/// of a node.
///
/// A snapshot stays valid while the node concurrently publishes newer
/// values; the value is released when the last clone is dropped.
pub struct Snapshot<T> {
    inner: Arc<Published<T>>,
    node: NodeId,
}

impl<T> Snapshot<T> {
    pub(crate) fn new(inner: Arc<Published<T>>, node: NodeId) -> Self {
        Snapshot { inner, node }
    }

    /// Shared handle to the value this snapshot holds.
    pub fn value(&self) -> Arc<T> {
        self.inner.value.clone()
    }

    /// The publishing node's version at the time of this publication.
    pub fn version(&self) -> Version {
        self.inner.version
    }

    /// Highest source epoch that contributed to this value.
    pub fn root_version(&self) -> Epoch {
        self.inner.root_version
    }

    /// Identity of the node that published this snapshot.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Snapshot {
            inner: self.inner.clone(),
            node: self.node,
        }
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("node", &self.node)
            .field("version", &self.inner.version)
            .field("root_version", &self.inner.root_version)
            .field("value", &*self.inner.value)
            .finish()
    }
}
