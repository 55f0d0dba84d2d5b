//! Cell Implementation
//!
//! A Cell is the fundamental reactive leaf. It holds a value, an equality
//! policy, and the revision at which the value last changed.
//!
//! # How Cells Work
//!
//! 1. When a cell is read inside a tracking frame (a formula or resource
//!    constructor), the frame records the cell and its current revision.
//!
//! 2. A write that the equality policy considers a change stores the value
//!    and stamps the cell with a fresh revision from the timeline. Anything
//!    that captured an older revision is now stale.
//!
//! 3. A write of an equal value is a no-op: no revision bump, no
//!    notification.
//!
//! # Freezing
//!
//! A frozen cell can no longer be written. Frames skip it entirely, since a
//! value that cannot change is not a dependency.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use super::internals::{Internals, LeafState, Reactive};
use super::runtime::{Revision, Timeline};
use crate::error::{Error, Result};

/// Equality policy shared by cells and formulas.
pub type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct CellInner<T> {
    value: RwLock<T>,
    equals: Equality<T>,
    leaf: Arc<LeafState>,
    timeline: Timeline,
}

/// A mutable reactive leaf holding a value of type `T`.
///
/// Cloning a `Cell` creates a new handle to the **same** value.
///
/// # Example
///
/// ```rust
/// use tessera_core::{Cell, Timeline};
///
/// let timeline = Timeline::new();
/// let count = Cell::new(&timeline, 0);
///
/// assert!(count.write(5));
/// // Equal writes are ignored
/// assert!(!count.write(5));
/// assert_eq!(count.read(), 5);
/// ```
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Cell<T>
where
    T: Send + Sync + 'static,
{
    /// Create a cell that compares values with `PartialEq`.
    pub fn new(timeline: &Timeline, value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(timeline, value, |a: &T, b: &T| a == b)
    }

    /// Create a cell with a custom equality policy.
    ///
    /// If `equals(current, new)` returns true, a write keeps the current
    /// value and the cell's revision does not advance.
    pub fn with_equality<F>(timeline: &Timeline, value: T, equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CellInner {
                value: RwLock::new(value),
                equals: Arc::new(equals),
                leaf: LeafState::new(timeline.now()),
                timeline: timeline.clone(),
            }),
        }
    }

    /// Read the value, recording a dependency in the current frame.
    pub fn read(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Borrow the value, recording a dependency in the current frame.
    ///
    /// # Deadlocks
    ///
    /// `f` runs while the value is borrowed. It may read this cell again, but
    /// writing it from inside `f` never returns. Clone with
    /// [`Cell::read`] first if you need to write back.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.consume();
        f(&*self.inner.value.read_recursive())
    }

    /// Read the value without recording a dependency.
    pub fn read_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.read_recursive().clone()
    }

    /// Write a new value. Returns true if the value changed.
    ///
    /// # Panics
    ///
    /// Panics if the cell has been frozen. Use [`Cell::try_write`] to get an
    /// error instead.
    pub fn write(&self, value: T) -> bool {
        match self.try_write(value) {
            Ok(changed) => changed,
            Err(error) => panic!("{error}"),
        }
    }

    /// Write a new value, failing if the cell has been frozen.
    ///
    /// The equality policy runs while the value is held for upgrade: it may
    /// read this cell, but must not write it.
    pub fn try_write(&self, value: T) -> Result<bool> {
        if self.is_frozen() {
            return Err(Error::FrozenCell);
        }

        let changed = {
            let current = self.inner.value.upgradable_read();
            if (self.inner.equals)(&*current, &value) {
                false
            } else {
                *RwLockUpgradableReadGuard::upgrade(current) = value;
                true
            }
        };

        if changed {
            let revision = self.inner.timeline.bump(&self.inner.leaf);
            tracing::trace!(cell = ?self.inner.leaf.id(), %revision, "cell updated");
        }

        Ok(changed)
    }

    /// Replace the value with `f(current)`. Returns true if it changed.
    ///
    /// The borrow ends before the write, so `f` may read the cell.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = {
            let current = self.inner.value.read_recursive();
            f(&*current)
        };
        self.write(next)
    }

    /// Make the cell constant.
    pub fn freeze(&self) {
        self.inner.leaf.freeze();
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.leaf.is_frozen()
    }

    /// The revision at which the value last changed.
    pub fn revision(&self) -> Revision {
        self.inner.leaf.last_updated()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.inner.timeline
    }
}

impl<T> Reactive for Cell<T> {
    fn internals(&self) -> Internals {
        Internals::leaf(&self.inner.leaf)
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.leaf.id())
            .field("value", &*self.inner.value.read_recursive())
            .field("updated", &self.inner.leaf.last_updated())
            .field("frozen", &self.inner.leaf.is_frozen())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::context::track;

    #[test]
    fn cell_read_and_write() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 0);
        assert_eq!(cell.read(), 0);

        assert!(cell.write(42));
        assert_eq!(cell.read(), 42);
    }

    #[test]
    fn cell_update() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 10);
        assert!(cell.update(|v| v + 5));
        assert_eq!(cell.read(), 15);
        assert!(!cell.update(|v| *v));
    }

    #[test]
    fn equal_write_does_not_advance_the_clock() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 5);
        let before = timeline.now();

        assert!(!cell.write(5));
        assert_eq!(timeline.now(), before);
        assert_eq!(cell.revision(), before);

        assert!(cell.write(6));
        assert!(timeline.now() > before);
        assert_eq!(cell.revision(), timeline.now());
    }

    #[test]
    fn custom_equality() {
        let timeline = Timeline::new();
        // Case-insensitive
        let cell = Cell::with_equality(&timeline, "Hello".to_string(), |a: &String, b: &String| {
            a.eq_ignore_ascii_case(b)
        });

        assert!(!cell.write("HELLO".to_string()));
        assert_eq!(cell.read(), "Hello");
        assert!(cell.write("world".to_string()));
    }

    #[test]
    fn read_records_dependency() {
        let timeline = Timeline::new();
        let a = Cell::new(&timeline, 1);
        let b = Cell::new(&timeline, 2);

        let (sum, snapshot) = track(|| a.read() + b.with(|v| *v) + a.read_untracked());
        assert_eq!(sum, 4);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains(&a));
        assert!(snapshot.contains(&b));
    }

    #[test]
    fn untracked_read_records_nothing() {
        let timeline = Timeline::new();
        let a = Cell::new(&timeline, 1);
        let (_, snapshot) = track(|| a.read_untracked());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn frozen_cell_rejects_writes() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 1);
        cell.freeze();

        assert!(matches!(cell.try_write(2), Err(Error::FrozenCell)));
        assert_eq!(cell.read(), 1);

        let (_, snapshot) = track(|| cell.read());
        assert!(snapshot.is_empty());
    }

    #[test]
    #[should_panic(expected = "frozen")]
    fn write_to_frozen_cell_panics() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 1);
        cell.freeze();
        cell.write(2);
    }

    #[test]
    fn cell_clone_shares_state() {
        let timeline = Timeline::new();
        let cell1 = Cell::new(&timeline, 0);
        let cell2 = cell1.clone();

        cell1.write(42);
        assert_eq!(cell2.read(), 42);
        assert_eq!(cell1.revision(), cell2.revision());
    }

    #[test]
    fn equality_may_read_the_cell() {
        use std::sync::OnceLock;

        let timeline = Timeline::new();
        let slot: Arc<OnceLock<Cell<i32>>> = Arc::new(OnceLock::new());
        let s = slot.clone();

        let cell = Cell::with_equality(&timeline, 1, move |current: &i32, next: &i32| {
            // Re-entrant read of the cell being written
            let seen = s.get().map(Cell::read_untracked);
            assert_eq!(seen, Some(*current));
            current == next
        });
        let _ = slot.set(cell.clone());

        assert!(cell.write(2));
        assert!(!cell.write(2));
        assert_eq!(cell.read(), 2);
    }

    #[test]
    fn borrow_and_update_may_read_the_cell() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 3);

        assert_eq!(cell.with(|v| *v + cell.read()), 6);
        assert!(cell.update(|v| *v + cell.read_untracked()));
        assert_eq!(cell.read(), 6);
    }
}
