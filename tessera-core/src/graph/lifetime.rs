//! Lifetime Graph
//!
//! The lifetime graph owns every finalization anchor issued by a timeline.
//! Nodes live in an arena keyed by [`LifetimeId`]; "linked children" are
//! plain edges in that arena, so finalizing a node is a walk over ids rather
//! than over object references.
//!
//! # Algorithm
//!
//! Finalizing a node:
//!
//! 1. If the node is no longer in the arena, it is already finalized: stop.
//! 2. Remove the node, taking its finalizers and children with it.
//! 3. Release the arena lock and run each finalizer in registration order.
//!    Each one is isolated: an `Err` or a panic is recorded and the pass moves
//!    on to the next finalizer.
//! 4. Finalize each child, depth first, in the order it was linked.
//!
//! The lock is never held while user code runs, so a finalizer may itself
//! call `finalize` (on any node, including its own) or register cleanups on
//! other nodes. Step 2 happens before step 3, so re-entrant calls on the same
//! node are no-ops.
//!
//! Finalized nodes do not stay behind. Ids are issued in sequence per graph,
//! so an issued id that is missing from the arena is known to be finalized
//! and late registrations still get an ordering error.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::node::{Finalizer, LifetimeId, LifetimeNode};
use crate::error::{BoxError, Error, FinalizeError, FinalizerFailure, Result};

/// Live nodes of one graph.
///
/// Finalized nodes are dropped. An id this graph issued that is no longer
/// live is finalized.
struct Arena {
    graph: u64,
    next: u64,
    live: HashMap<LifetimeId, LifetimeNode>,
}

impl Arena {
    fn new() -> Self {
        static GRAPHS: AtomicU64 = AtomicU64::new(0);
        Self {
            graph: GRAPHS.fetch_add(1, Ordering::Relaxed),
            next: 0,
            live: HashMap::new(),
        }
    }

    fn insert(&mut self, node: LifetimeNode) -> LifetimeId {
        let id = LifetimeId::new(self.graph, self.next);
        self.next += 1;
        self.live.insert(id, node);
        id
    }

    fn issued(&self, id: LifetimeId) -> bool {
        id.graph() == self.graph && id.raw() < self.next
    }

    fn is_finalized(&self, id: LifetimeId) -> bool {
        self.issued(id) && !self.live.contains_key(&id)
    }

    /// The live node `id`, or why there is none.
    fn live_mut(&mut self, id: LifetimeId) -> Result<&mut LifetimeNode> {
        let issued = self.issued(id);
        self.live.get_mut(&id).ok_or(if issued {
            Error::AlreadyFinalized(id)
        } else {
            Error::UnknownLifetime(id)
        })
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/// The arena of lifetime nodes.
///
/// Cloning shares the same arena.
#[derive(Clone, Default)]
pub struct LifetimeGraph {
    nodes: Arc<Mutex<Arena>>,
}

impl LifetimeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh, unfinalized node.
    pub fn create(&self) -> LifetimeId {
        self.nodes.lock().insert(LifetimeNode::new())
    }

    /// Add a fresh node whose first finalizer is `finalizer`.
    pub(crate) fn create_with(&self, finalizer: Finalizer) -> LifetimeId {
        let mut node = LifetimeNode::new();
        node.push_finalizer(finalizer);
        self.nodes.lock().insert(node)
    }

    /// Register a cleanup callback on `node`.
    ///
    /// Fails with [`Error::AlreadyFinalized`] if the node is finalized.
    pub fn on_cleanup<F>(&self, node: LifetimeId, cleanup: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(
            node,
            Box::new(move || {
                cleanup();
                Ok(())
            }),
        )
    }

    /// Register a cleanup callback that can fail.
    ///
    /// A failure is reported by the finalize pass that runs it; it does not
    /// stop the remaining finalizers.
    pub fn try_on_cleanup<F, E>(&self, node: LifetimeId, cleanup: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.register(node, Box::new(move || cleanup().map_err(Into::into)))
    }

    fn register(&self, node: LifetimeId, finalizer: Finalizer) -> Result<()> {
        let mut nodes = self.nodes.lock();
        match nodes.live_mut(node) {
            Ok(entry) => {
                entry.push_finalizer(finalizer);
                Ok(())
            }
            Err(error) => {
                if error.is_ordering() {
                    tracing::warn!(lifetime = %node, "cleanup registered after finalization");
                }
                Err(error)
            }
        }
    }

    /// Link `child` under `parent`: finalizing the parent finalizes the child.
    ///
    /// A child may be linked under many parents; it is finalized once, by
    /// whichever parent goes first. The returned [`Unlink`] removes this one
    /// edge.
    pub fn link(&self, parent: LifetimeId, child: LifetimeId) -> Result<Unlink> {
        let mut nodes = self.nodes.lock();

        if !nodes.issued(child) {
            return Err(Error::UnknownLifetime(child));
        }
        nodes.live_mut(parent)?.add_child(child);

        Ok(Unlink {
            nodes: Arc::downgrade(&self.nodes),
            parent,
            child,
        })
    }

    /// Whether `node` has been finalized. Unknown nodes report false.
    pub fn is_finalized(&self, node: LifetimeId) -> bool {
        self.nodes.lock().is_finalized(node)
    }

    /// Children currently linked under `node`, in link order.
    pub fn children(&self, node: LifetimeId) -> Vec<LifetimeId> {
        self.nodes
            .lock()
            .live
            .get(&node)
            .map(|entry| entry.children().collect())
            .unwrap_or_default()
    }

    /// Number of cleanups waiting to run on `node`.
    pub fn pending_cleanups(&self, node: LifetimeId) -> usize {
        self.nodes
            .lock()
            .live
            .get(&node)
            .map(LifetimeNode::finalizer_count)
            .unwrap_or(0)
    }

    /// Number of nodes not yet finalized.
    pub fn len(&self) -> usize {
        self.nodes.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finalize `node` and, recursively, its linked children.
    ///
    /// Idempotent. Every finalizer runs even if earlier ones fail; the
    /// failures of the whole pass are returned together.
    pub fn finalize(&self, node: LifetimeId) -> Result<()> {
        let mut failures = Vec::new();
        self.finalize_into(node, &mut failures);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FinalizeError { failures }.into())
        }
    }

    fn finalize_into(&self, node: LifetimeId, failures: &mut Vec<FinalizerFailure>) {
        // Leaving the arena is what marks the node finalized.
        let Some(entry) = self.nodes.lock().live.remove(&node) else {
            return;
        };
        let (finalizers, children) = entry.into_teardown();

        tracing::debug!(
            lifetime = %node,
            finalizers = finalizers.len(),
            children = children.len(),
            "finalizing lifetime"
        );

        for (index, finalizer) in finalizers.into_iter().enumerate() {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(finalizer)) {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };

            tracing::error!(lifetime = %node, index, error = %outcome, "finalizer failed");
            failures.push(FinalizerFailure {
                lifetime: node,
                index,
                message: outcome,
            });
        }

        for child in children {
            self.finalize_into(child, failures);
        }
    }
}

impl std::fmt::Debug for LifetimeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.nodes.lock();
        f.debug_struct("LifetimeGraph")
            .field("live", &nodes.live.len())
            .field("issued", &nodes.next)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Handle that removes one parent/child link.
///
/// Dropping it leaves the link in place.
#[derive(Debug)]
pub struct Unlink {
    nodes: Weak<Mutex<Arena>>,
    parent: LifetimeId,
    child: LifetimeId,
}

impl Unlink {
    pub fn parent(&self) -> LifetimeId {
        self.parent
    }

    pub fn child(&self) -> LifetimeId {
        self.child
    }

    /// Remove the link. Returns false if it was already gone (the parent was
    /// finalized, or the link was removed some other way).
    pub fn unlink(self) -> bool {
        let Some(nodes) = self.nodes.upgrade() else {
            return false;
        };
        let mut nodes = nodes.lock();
        nodes
            .live
            .get_mut(&self.parent)
            .map(|entry| entry.remove_child(self.child))
            .unwrap_or(false)
    }
}
