//! Tracking Frames
//!
//! A tracking frame records every reactive value read while a computation
//! runs. The result is a [`DependencySnapshot`]: the set of values read, plus
//! the revision each had when it was first read.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Entering a frame pushes it; the
//! guard pops it when the computation completes (or unwinds). Reads are
//! recorded into the innermost frame.
//!
//! Enclosing frames still see everything read below them:
//!
//! - Formulas and resources evaluate in a private frame and expose the result
//!   as composite internals, which the enclosing frame records on read.
//! - A [`track`] block hands its members, with the revisions it captured, to
//!   the enclosing frame when it finishes.
//!
//! An [`untracked`] block pushes a frame that records nothing.
//!
//! Reads with no active frame are legal and simply not recorded.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};

use super::internals::{Internals, Reactive, ReactiveId};
use super::runtime::Revision;

thread_local! {
    static FRAME_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the frame stack.
#[derive(Debug)]
struct Frame {
    id: u64,
    /// False for an `untracked` block.
    recording: bool,
    members: IndexMap<ReactiveId, Tracked>,
}

/// A member of a snapshot and the revision it had when read.
#[derive(Debug, Clone)]
struct Tracked {
    internals: Internals,
    revision: Revision,
}

/// The dependencies captured by one evaluation.
///
/// Members are deduplicated by identity and kept in first-read order.
#[derive(Debug, Clone, Default)]
pub struct DependencySnapshot {
    members: IndexMap<ReactiveId, Tracked>,
}

impl DependencySnapshot {
    /// Build a snapshot of `internals` as they are right now.
    pub(crate) fn of(internals: Internals) -> Self {
        let mut members = IndexMap::new();
        members.insert(
            internals.id(),
            Tracked {
                revision: internals.last_updated(),
                internals,
            },
        );
        Self { members }
    }

    /// Number of distinct members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether nothing was read.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `value` was read during the evaluation.
    pub fn contains<R: Reactive + ?Sized>(&self, value: &R) -> bool {
        self.members.contains_key(&value.internals().id())
    }

    /// Whether any member has moved past the revision it was captured at.
    ///
    /// O(number of members).
    pub fn is_stale(&self) -> bool {
        self.members
            .values()
            .any(|tracked| tracked.internals.last_updated() > tracked.revision)
    }

    /// The highest revision captured.
    pub fn max_revision(&self) -> Revision {
        self.members
            .values()
            .map(|tracked| tracked.revision)
            .max()
            .unwrap_or(Revision::ZERO)
    }

    /// The highest revision among the members right now.
    pub fn current_revision(&self) -> Revision {
        self.members
            .values()
            .map(|tracked| tracked.internals.last_updated())
            .max()
            .unwrap_or(Revision::ZERO)
    }

    /// The members' internals, in first-read order.
    pub fn internals(&self) -> impl Iterator<Item = &Internals> + '_ {
        self.members.values().map(|tracked| &tracked.internals)
    }

    /// Every leaf reachable from the members.
    pub(crate) fn leaves(&self) -> IndexSet<ReactiveId> {
        let mut leaves = IndexSet::new();
        for internals in self.internals() {
            internals.collect_leaves(&mut leaves);
        }
        leaves
    }
}

/// Guard for an active frame.
///
/// Pops the frame when dropped, so the stack stays balanced even if the
/// computation panics.
pub(crate) struct TrackingFrame {
    id: u64,
    active: bool,
}

impl TrackingFrame {
    /// Push a new frame. Reads go to it until it is finished or dropped.
    pub(crate) fn enter() -> Self {
        Self::push(true)
    }

    /// Push a frame that swallows reads.
    pub(crate) fn silence() -> Self {
        Self::push(false)
    }

    fn push(recording: bool) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        FRAME_STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                id,
                recording,
                members: IndexMap::new(),
            });
        });

        Self { id, active: true }
    }

    /// Pop the frame and return what it recorded.
    pub(crate) fn finish(mut self) -> DependencySnapshot {
        self.active = false;
        let frame = self.pop();
        DependencySnapshot {
            members: frame.map(|frame| frame.members).unwrap_or_default(),
        }
    }

    fn pop(&self) -> Option<Frame> {
        FRAME_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Verify we're popping the right frame.
            if let Some(frame) = &popped {
                debug_assert_eq!(
                    frame.id, self.id,
                    "tracking frame mismatch: expected {}, got {}",
                    self.id, frame.id
                );
            }
            popped
        })
    }
}

impl Drop for TrackingFrame {
    fn drop(&mut self) {
        if self.active {
            self.pop();
        }
    }
}

/// Record a read into the innermost frame.
pub(crate) fn record(internals: &Internals) {
    if internals.is_constant() {
        return;
    }

    FRAME_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut().filter(|frame| frame.recording) {
            frame
                .members
                .entry(internals.id())
                .or_insert_with(|| Tracked {
                    revision: internals.last_updated(),
                    internals: internals.clone(),
                });
        }
    });
}

/// Merge a finished snapshot into the innermost frame. A member already
/// present keeps the revision it was first read at.
fn propagate(snapshot: &DependencySnapshot) {
    FRAME_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut().filter(|frame| frame.recording) {
            for (id, tracked) in &snapshot.members {
                frame
                    .members
                    .entry(*id)
                    .or_insert_with(|| tracked.clone());
            }
        }
    });
}

/// Run `body` in a private frame. Nothing it reads reaches the enclosing
/// frame; the caller exposes the snapshot some other way.
pub(crate) fn capture<R>(body: impl FnOnce() -> R) -> (R, DependencySnapshot) {
    let frame = TrackingFrame::enter();
    let result = body();
    (result, frame.finish())
}

/// Run `body` in a fresh frame and return its result with the dependencies
/// it read.
///
/// The enclosing frame, if any, records the same dependencies.
pub fn track<R>(body: impl FnOnce() -> R) -> (R, DependencySnapshot) {
    let (result, snapshot) = capture(body);
    propagate(&snapshot);
    (result, snapshot)
}

/// Run `body` without recording its reads anywhere.
pub fn untracked<R>(body: impl FnOnce() -> R) -> R {
    let _frame = TrackingFrame::silence();
    body()
}

/// Whether reads on this thread are currently being recorded.
///
/// False outside any frame and inside [`untracked`].
pub fn is_tracking() -> bool {
    FRAME_STACK.with(|stack| stack.borrow().last().is_some_and(|frame| frame.recording))
}
