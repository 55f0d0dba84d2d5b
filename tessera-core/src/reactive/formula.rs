//! Formula Implementation
//!
//! A Formula is a memoized derived value that revalidates lazily.
//!
//! # How Formulas Work
//!
//! 1. On first read, the formula runs its computation inside a tracking
//!    frame, caches the result, and keeps the dependency snapshot the frame
//!    produced.
//!
//! 2. On later reads it compares each snapshot member's current revision to
//!    the one it captured. If none moved, the cached value is returned.
//!
//! 3. If any moved, the computation runs again (once), a new snapshot is
//!    taken, and the cache is replaced.
//!
//! Nothing is pushed to a formula when a cell changes. A formula that is
//! never read never recomputes.
//!
//! # Composite Internals
//!
//! A formula has no revision of its own. Its fingerprint, as seen by an
//! enclosing frame, is the composite of its current snapshot's members. That
//! composite changes shape only when the formula is read and found stale.
//!
//! # Failure Modes
//!
//! - **Computation returns `Err`** (fallible formulas): the error goes to the
//!   caller and the cache keeps its last good value and snapshot. The
//!   snapshot is still stale, so the next read retries.
//! - **Computation panics**: same as above; the frame stack unwinds cleanly.

use std::convert::Infallible;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::cell::Equality;
use super::context::{capture, DependencySnapshot};
use super::internals::{CompositeState, Internals, Reactive};

/// Validation state of a formula, as seen without recomputing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaStatus {
    /// Never read.
    Uninitialized,

    /// The cached value is up to date.
    Valid,

    /// A dependency moved since the last computation. The next read
    /// recomputes.
    Stale,
}

enum FormulaState<T> {
    Uninitialized,
    Computed {
        value: T,
        snapshot: DependencySnapshot,
    },
}

type Compute<T, E> = Box<dyn Fn() -> Result<T, E> + Send + Sync>;

struct FormulaInner<T, E> {
    compute: Compute<T, E>,
    /// `None` means every recomputation replaces the cached value.
    equals: Option<Equality<T>>,
    state: Mutex<FormulaState<T>>,
    composite: Arc<CompositeState>,
    recomputes: AtomicU64,
}

/// A memoized derived computation.
///
/// `E` is the error type of a fallible computation; plain formulas use
/// [`Infallible`] and are read with [`Formula::read`].
///
/// Cloning a `Formula` creates a new handle to the **same** cache.
///
/// # Example
///
/// ```rust
/// use tessera_core::{Cell, Formula, Timeline};
///
/// let timeline = Timeline::new();
/// let count = Cell::new(&timeline, 1);
///
/// let c = count.clone();
/// let doubled = Formula::new(move || c.read() * 2);
///
/// assert_eq!(doubled.read(), 2);
/// count.write(3);
/// assert_eq!(doubled.read(), 6);
/// ```
pub struct Formula<T, E = Infallible> {
    inner: Arc<FormulaInner<T, E>>,
}

impl<T> Formula<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a formula. The computation does not run until the first read.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(Box::new(move || Ok(compute())), None)
    }

    /// Create a formula that keeps its cached value when a recomputation
    /// produces an equal one.
    pub fn with_equality<F, Q>(compute: F, equals: Q) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        Q: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::build(Box::new(move || Ok(compute())), Some(Arc::new(equals)))
    }

    /// Read the value, recomputing first if the formula is stale.
    pub fn read(&self) -> T {
        match self.try_read() {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }
}

impl<T, E> Formula<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: 'static,
{
    /// Create a formula whose computation can fail.
    pub fn fallible<F>(compute: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        Self::build(Box::new(compute), None)
    }

    fn build(compute: Compute<T, E>, equals: Option<Equality<T>>) -> Self {
        Self {
            inner: Arc::new(FormulaInner {
                compute,
                equals,
                state: Mutex::new(FormulaState::Uninitialized),
                composite: CompositeState::new(Vec::new()),
                recomputes: AtomicU64::new(0),
            }),
        }
    }

    /// Read the value, recomputing first if the formula is stale.
    ///
    /// Records the formula's composite internals in the current frame.
    pub fn try_read(&self) -> Result<T, E> {
        let value = self.validate()?;
        self.consume();
        Ok(value)
    }

    fn validate(&self) -> Result<T, E> {
        let superseded = {
            let state = self.inner.state.lock();
            match &*state {
                FormulaState::Computed { value, snapshot } if !snapshot.is_stale() => {
                    return Ok(value.clone());
                }
                FormulaState::Computed { snapshot, .. } => Some(snapshot.current_revision()),
                FormulaState::Uninitialized => None,
            }
        };

        tracing::trace!(formula = ?self.inner.composite.internals().id(), "recomputing formula");

        // The lock is released while user code runs, so the computation can
        // read other formulas freely.
        let (result, snapshot) = capture(|| (self.inner.compute)());
        let fresh = result?;
        self.inner.recomputes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.inner.state.lock();
        let value = match std::mem::replace(&mut *state, FormulaState::Uninitialized) {
            FormulaState::Computed { value: last, .. } if self.is_equal(&last, &fresh) => last,
            _ => fresh,
        };

        if let Some(revision) = superseded {
            self.inner.composite.raise_floor(revision);
        }
        self.inner
            .composite
            .set_parts(snapshot.internals().cloned().collect());

        *state = FormulaState::Computed {
            value: value.clone(),
            snapshot,
        };

        Ok(value)
    }

    fn is_equal(&self, last: &T, fresh: &T) -> bool {
        self.inner
            .equals
            .as_ref()
            .map(|equals| equals(last, fresh))
            .unwrap_or(false)
    }

    /// Inspect the formula without recomputing or recording anything.
    pub fn status(&self) -> FormulaStatus {
        match &*self.inner.state.lock() {
            FormulaState::Uninitialized => FormulaStatus::Uninitialized,
            FormulaState::Computed { snapshot, .. } if snapshot.is_stale() => FormulaStatus::Stale,
            FormulaState::Computed { .. } => FormulaStatus::Valid,
        }
    }

    /// The cached value, without validating or tracking.
    pub fn peek(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            FormulaState::Computed { value, .. } => Some(value.clone()),
            FormulaState::Uninitialized => None,
        }
    }

    /// The dependency snapshot of the last computation.
    pub fn snapshot(&self) -> Option<DependencySnapshot> {
        match &*self.inner.state.lock() {
            FormulaState::Computed { snapshot, .. } => Some(snapshot.clone()),
            FormulaState::Uninitialized => None,
        }
    }

    /// How many times the computation has completed.
    pub fn recompute_count(&self) -> u64 {
        self.inner.recomputes.load(Ordering::SeqCst)
    }
}

impl<T, E> Reactive for Formula<T, E> {
    fn internals(&self) -> Internals {
        self.inner.composite.internals()
    }
}

impl<T, E> Clone for Formula<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Debug for Formula<T, E>
where
    T: Clone + Send + Sync + Debug + 'static,
    E: 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formula")
            .field("id", &self.internals().id())
            .field("status", &self.status())
            .field("value", &self.peek())
            .field("recomputes", &self.recompute_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
