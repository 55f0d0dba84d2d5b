//! Lifetime Nodes
//!
//! This module defines the nodes that live in the lifetime graph.

use std::fmt;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::error::BoxError;

/// Unique identifier for a node in the lifetime graph.
///
/// Ids are issued in sequence by one graph. The graph tag keeps ids from
/// different graphs apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LifetimeId {
    graph: u64,
    seq: u64,
}

impl LifetimeId {
    pub(crate) fn new(graph: u64, seq: u64) -> Self {
        Self { graph, seq }
    }

    pub(crate) fn graph(&self) -> u64 {
        self.graph
    }

    /// Position in the issuing graph's sequence.
    pub fn raw(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for LifetimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.graph, self.seq)
    }
}

/// A cleanup callback. Infallible callbacks are wrapped to return `Ok(())`.
pub(crate) type Finalizer = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

/// A live node in the lifetime graph.
///
/// Finalizers are kept in registration order, and so are children. A child
/// linked twice keeps its first position. A node leaves the arena when it is
/// finalized.
pub(crate) struct LifetimeNode {
    finalizers: SmallVec<[Finalizer; 2]>,
    children: IndexSet<LifetimeId>,
}

impl LifetimeNode {
    pub(crate) fn new() -> Self {
        Self {
            finalizers: SmallVec::new(),
            children: IndexSet::new(),
        }
    }

    pub(crate) fn push_finalizer(&mut self, finalizer: Finalizer) {
        self.finalizers.push(finalizer);
    }

    /// Add a child. Returns false if it was already linked.
    pub(crate) fn add_child(&mut self, child: LifetimeId) -> bool {
        self.children.insert(child)
    }

    /// Remove a child, preserving the order of the remaining children.
    pub(crate) fn remove_child(&mut self, child: LifetimeId) -> bool {
        self.children.shift_remove(&child)
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = LifetimeId> + '_ {
        self.children.iter().copied()
    }

    pub(crate) fn finalizer_count(&self) -> usize {
        self.finalizers.len()
    }

    /// Consume the node, handing back everything that has to run.
    pub(crate) fn into_teardown(self) -> (SmallVec<[Finalizer; 2]>, Vec<LifetimeId>) {
        (self.finalizers, self.children.into_iter().collect())
    }
}

impl fmt::Debug for LifetimeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeNode")
            .field("finalizers", &self.finalizers.len())
            .field("children", &self.children)
            .finish()
    }
}
