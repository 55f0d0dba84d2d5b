//! Reactive Internals
//!
//! Every reactive value exposes its dependency fingerprint as an
//! [`Internals`]. There are exactly two shapes:
//!
//! - A **leaf** (cells and markers): a single `last_updated` revision that
//!   moves only when the leaf is written.
//! - A **composite** (formulas, resources, [`CompositeInternals`]): the
//!   pointwise maximum of the `last_updated` of its current parts.
//!
//! Tracking frames record internals, not values. A formula read inside
//! another formula records the inner formula's composite, so the outer
//! formula transitively depends on the inner one's leaves without ever
//! seeing them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::RwLock;

use super::context;
use super::runtime::Revision;

/// Unique identity of a reactive value.
///
/// Frames deduplicate reads by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactiveId(u64);

impl ReactiveId {
    /// Generate a new unique reactive ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A trait for values that take part in dependency tracking.
pub trait Reactive {
    /// The value's dependency fingerprint.
    fn internals(&self) -> Internals;

    /// Record a read of this value in the current tracking frame, if any.
    fn consume(&self) {
        self.internals().consume();
    }

    /// The value's current fingerprint revision.
    fn last_updated(&self) -> Revision {
        self.internals().last_updated()
    }
}

/// State of a leaf: a cell or a marker.
#[derive(Debug)]
pub(crate) struct LeafState {
    id: ReactiveId,
    last_updated: AtomicU64,
    frozen: AtomicBool,
}

impl LeafState {
    pub(crate) fn new(revision: Revision) -> Arc<Self> {
        Arc::new(Self {
            id: ReactiveId::new(),
            last_updated: AtomicU64::new(revision.get()),
            frozen: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> ReactiveId {
        self.id
    }

    pub(crate) fn last_updated(&self) -> Revision {
        Revision::new(self.last_updated.load(Ordering::SeqCst))
    }

    pub(crate) fn set_last_updated(&self, revision: Revision) {
        self.last_updated.store(revision.get(), Ordering::SeqCst);
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}

/// State of a composite.
///
/// `floor` never decreases. Formulas raise it to the revision at which their
/// previous dependency set went stale, so replacing the parts with an older
/// set cannot lower the fingerprint.
#[derive(Debug)]
pub(crate) struct CompositeState {
    id: ReactiveId,
    parts: RwLock<Vec<Internals>>,
    floor: AtomicU64,
}

impl CompositeState {
    pub(crate) fn new(parts: Vec<Internals>) -> Arc<Self> {
        Arc::new(Self {
            id: ReactiveId::new(),
            parts: RwLock::new(parts),
            floor: AtomicU64::new(0),
        })
    }

    pub(crate) fn set_parts(&self, parts: Vec<Internals>) {
        *self.parts.write() = parts;
    }

    pub(crate) fn raise_floor(&self, revision: Revision) {
        self.floor.fetch_max(revision.get(), Ordering::SeqCst);
    }

    pub(crate) fn last_updated(&self) -> Revision {
        let floor = Revision::new(self.floor.load(Ordering::SeqCst));
        self.parts
            .read()
            .iter()
            .map(Internals::last_updated)
            .fold(floor, Revision::max)
    }

    pub(crate) fn internals(self: &Arc<Self>) -> Internals {
        Internals(Repr::Composite(Arc::clone(self)))
    }
}

#[derive(Debug, Clone)]
enum Repr {
    Leaf(Arc<LeafState>),
    Composite(Arc<CompositeState>),
}

/// A reactive value's dependency fingerprint.
///
/// Cheap to clone; clones share the underlying state.
#[derive(Debug, Clone)]
pub struct Internals(Repr);

impl Internals {
    pub(crate) fn leaf(state: &Arc<LeafState>) -> Self {
        Self(Repr::Leaf(Arc::clone(state)))
    }

    /// Identity used for deduplication.
    pub fn id(&self) -> ReactiveId {
        match &self.0 {
            Repr::Leaf(leaf) => leaf.id(),
            Repr::Composite(composite) => composite.id,
        }
    }

    /// Current revision: the leaf's own, or the maximum over the parts.
    pub fn last_updated(&self) -> Revision {
        match &self.0 {
            Repr::Leaf(leaf) => leaf.last_updated(),
            Repr::Composite(composite) => composite.last_updated(),
        }
    }

    /// Whether this fingerprint can never change (a frozen leaf).
    pub fn is_constant(&self) -> bool {
        match &self.0 {
            Repr::Leaf(leaf) => leaf.is_frozen(),
            Repr::Composite(_) => false,
        }
    }

    /// Whether this is a composite.
    pub fn is_composite(&self) -> bool {
        matches!(self.0, Repr::Composite(_))
    }

    /// Record this fingerprint in the current tracking frame, if any.
    pub fn consume(&self) {
        context::record(self);
    }

    /// Collect the ids of every leaf currently reachable from here.
    pub(crate) fn collect_leaves(&self, leaves: &mut IndexSet<ReactiveId>) {
        match &self.0 {
            Repr::Leaf(leaf) => {
                if !leaf.is_frozen() {
                    leaves.insert(leaf.id());
                }
            }
            Repr::Composite(composite) => {
                for part in composite.parts.read().iter() {
                    part.collect_leaves(leaves);
                }
            }
        }
    }
}

impl Reactive for Internals {
    fn internals(&self) -> Internals {
        self.clone()
    }
}

/// One logical reactive value built out of several others.
///
/// Its fingerprint is the maximum of its parts' fingerprints. The set of parts
/// can be replaced as the logical value changes shape.
#[derive(Debug, Clone)]
pub struct CompositeInternals {
    state: Arc<CompositeState>,
}

impl CompositeInternals {
    /// Create a composite over `parts`.
    pub fn new<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Internals>,
    {
        Self {
            state: CompositeState::new(parts.into_iter().collect()),
        }
    }

    /// Replace the parts.
    pub fn set_parts<I>(&self, parts: I)
    where
        I: IntoIterator<Item = Internals>,
    {
        self.state.set_parts(parts.into_iter().collect());
    }

    /// Number of parts.
    pub fn len(&self) -> usize {
        self.state.parts.read().len()
    }

    /// Whether there are no parts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn state(&self) -> &Arc<CompositeState> {
        &self.state
    }
}

impl Reactive for CompositeInternals {
    fn internals(&self) -> Internals {
        self.state.internals()
    }
}
