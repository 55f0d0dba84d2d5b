//! Timeline
//!
//! The timeline is the central coordinator that connects cells, formulas,
//! resources and subscriptions. It owns:
//!
//! - The logical clock: a monotonically increasing [`Revision`] counter. It
//!   advances only when a leaf (cell or marker) actually changes.
//! - The lifetime graph used to finalize resources.
//! - The subscription registry used to push invalidations to a host.
//!
//! # How It Works
//!
//! 1. A cell write that changes the value advances the clock and stamps the
//!    cell with the new revision.
//!
//! 2. The timeline looks up subscriptions watching that cell. Each one whose
//!    snapshot is now stale is disarmed and queued.
//!
//! 3. Queued notifications are delivered when the write completes, when the
//!    outermost [`Timeline::batch`] ends, or, in [`NotifyMode::Deferred`],
//!    when the host calls [`Timeline::flush_notifications`].
//!
//! Formulas are never recomputed here. They revalidate lazily on read.
//!
//! # Lifecycle
//!
//! [`Timeline::global`] is created once, on first use, and lives for the
//! rest of the process. It is never reset. Tests (or hosts that want an
//! isolated clock) build their own with [`Timeline::new`] and pass the handle
//! to every value they construct.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::context::DependencySnapshot;
use super::internals::{LeafState, ReactiveId};
use super::subscriber::{SubscriptionId, SubscriptionState};
use crate::error::{BoxError, Result};
use crate::graph::{LifetimeGraph, LifetimeId, Unlink};

/// A logical timestamp from the timeline's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(u64);

impl Revision {
    /// Older than anything a timeline hands out.
    pub const ZERO: Revision = Revision(0);

    /// The default starting revision of a timeline.
    pub const INITIAL: Revision = Revision(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// When queued invalidations are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    /// Deliver as soon as the triggering write (or outermost batch) completes.
    #[default]
    Immediate,

    /// Hold notifications until the host calls
    /// [`Timeline::flush_notifications`].
    Deferred,
}

/// Timeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineConfig {
    /// Revision the clock starts at. Every new leaf is stamped with it.
    pub initial_revision: Revision,
    /// Notification delivery policy.
    pub notify: NotifyMode,
}

impl TimelineConfig {
    pub fn with_initial_revision(mut self, revision: Revision) -> Self {
        self.initial_revision = revision;
        self
    }

    pub fn with_notify(mut self, notify: NotifyMode) -> Self {
        self.notify = notify;
        self
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            initial_revision: Revision::INITIAL,
            notify: NotifyMode::Immediate,
        }
    }
}

struct TimelineInner {
    now: AtomicU64,
    config: TimelineConfig,
    lifetimes: LifetimeGraph,
    /// Leaf id -> subscriptions watching it.
    watchers: DashMap<ReactiveId, SmallVec<[SubscriptionId; 4]>>,
    subscriptions: DashMap<SubscriptionId, Arc<SubscriptionState>>,
    batch_depth: AtomicUsize,
    pending: Mutex<IndexMap<SubscriptionId, Arc<SubscriptionState>>>,
}

/// Handle to a timeline. Cheap to clone; clones share the same clock.
#[derive(Clone)]
pub struct Timeline {
    inner: Arc<TimelineInner>,
}

static GLOBAL: OnceLock<Timeline> = OnceLock::new();

impl Timeline {
    /// Create an isolated timeline with the default configuration.
    pub fn new() -> Self {
        Self::with_config(TimelineConfig::default())
    }

    /// Create an isolated timeline.
    pub fn with_config(config: TimelineConfig) -> Self {
        Self {
            inner: Arc::new(TimelineInner {
                now: AtomicU64::new(config.initial_revision.get()),
                config,
                lifetimes: LifetimeGraph::new(),
                watchers: DashMap::new(),
                subscriptions: DashMap::new(),
                batch_depth: AtomicUsize::new(0),
                pending: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// The process-wide timeline.
    pub fn global() -> &'static Timeline {
        GLOBAL.get_or_init(Timeline::new)
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.inner.config
    }

    /// The current revision.
    pub fn now(&self) -> Revision {
        Revision::new(self.inner.now.load(Ordering::SeqCst))
    }

    /// Whether two handles refer to the same timeline.
    pub fn ptr_eq(&self, other: &Timeline) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The lifetime graph backing this timeline.
    pub fn lifetimes(&self) -> &LifetimeGraph {
        &self.inner.lifetimes
    }

    fn advance(&self) -> Revision {
        Revision::new(self.inner.now.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Stamp `leaf` with a fresh revision and wake whatever watches it.
    pub(crate) fn bump(&self, leaf: &LeafState) -> Revision {
        let revision = self.advance();
        leaf.set_last_updated(revision);
        self.leaf_updated(leaf.id());
        revision
    }

    fn leaf_updated(&self, leaf: ReactiveId) {
        let watching = match self.inner.watchers.get(&leaf) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        for id in watching {
            let Some(state) = self.inner.subscriptions.get(&id).map(|s| Arc::clone(s.value())) else {
                continue;
            };

            if state.trip() {
                tracing::trace!(subscription = ?id, "subscription invalidated");
                self.unwatch(&state);
                self.inner.pending.lock().insert(id, state);
            }
        }

        self.deliver_if_idle();
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Run `body` as one transaction: each subscription fires at most once,
    /// after the outermost batch ends.
    pub fn batch<R>(&self, body: impl FnOnce() -> R) -> R {
        struct BatchGuard<'a>(&'a Timeline);

        impl Drop for BatchGuard<'_> {
            fn drop(&mut self) {
                let previous = self.0.inner.batch_depth.fetch_sub(1, Ordering::SeqCst);
                if previous == 1 && !std::thread::panicking() {
                    self.0.deliver_if_idle();
                }
            }
        }

        self.inner.batch_depth.fetch_add(1, Ordering::SeqCst);
        let _guard = BatchGuard(self);
        body()
    }

    /// Deliver every queued notification now. Returns how many were
    /// delivered.
    ///
    /// Callbacks that write cells may queue more notifications; those are
    /// delivered in the same call.
    pub fn flush_notifications(&self) -> usize {
        let mut delivered = 0;

        loop {
            let pending = std::mem::take(&mut *self.inner.pending.lock());
            if pending.is_empty() {
                break;
            }

            tracing::debug!(count = pending.len(), "flushing notifications");
            for (_, state) in pending {
                state.deliver();
                delivered += 1;
            }
        }

        delivered
    }

    /// Number of notifications waiting for delivery.
    pub fn pending_notifications(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn deliver_if_idle(&self) {
        if self.inner.config.notify == NotifyMode::Immediate
            && self.inner.batch_depth.load(Ordering::SeqCst) == 0
        {
            self.flush_notifications();
        }
    }

    // ------------------------------------------------------------------------
    // Subscription registry
    // ------------------------------------------------------------------------

    pub(crate) fn register(&self, state: &Arc<SubscriptionState>) {
        self.inner
            .subscriptions
            .insert(state.id(), Arc::clone(state));
    }

    /// Point `state` at `snapshot`, replacing what it watched before.
    pub(crate) fn arm(&self, state: &Arc<SubscriptionState>, snapshot: DependencySnapshot) {
        self.unwatch(state);
        self.inner.pending.lock().shift_remove(&state.id());

        for leaf in state.arm(snapshot) {
            self.inner.watchers.entry(leaf).or_default().push(state.id());
        }

        // A leaf may have moved between the read and the arming.
        if state.trip() {
            self.unwatch(state);
            self.inner.pending.lock().insert(state.id(), Arc::clone(state));
            self.deliver_if_idle();
        }
    }

    pub(crate) fn unsubscribe(&self, state: &Arc<SubscriptionState>) {
        state.disarm();
        self.unwatch(state);
        self.inner.subscriptions.remove(&state.id());
        self.inner.pending.lock().shift_remove(&state.id());
    }

    fn unwatch(&self, state: &SubscriptionState) {
        let id = state.id();
        for leaf in state.take_leaves() {
            if let Some(mut entry) = self.inner.watchers.get_mut(&leaf) {
                entry.retain(|watcher| *watcher != id);
            }
            self.inner.watchers.remove_if(&leaf, |_, watching| watching.is_empty());
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    // ------------------------------------------------------------------------
    // Lifetimes
    // ------------------------------------------------------------------------

    /// Create a new lifetime node.
    pub fn create_lifetime(&self) -> LifetimeId {
        self.inner.lifetimes.create()
    }

    /// Register a cleanup on `node`. Fails with an ordering error if `node`
    /// is already finalized.
    pub fn on_cleanup<F>(&self, node: LifetimeId, cleanup: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.lifetimes.on_cleanup(node, cleanup)
    }

    /// Register a cleanup on `node` that may fail.
    pub fn try_on_cleanup<F, E>(&self, node: LifetimeId, cleanup: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.inner.lifetimes.try_on_cleanup(node, cleanup)
    }

    /// Finalize `child` whenever `parent` is finalized.
    pub fn link(&self, parent: LifetimeId, child: LifetimeId) -> Result<Unlink> {
        self.inner.lifetimes.link(parent, child)
    }

    /// Finalize `node` and everything linked under it. Idempotent.
    pub fn finalize(&self, node: LifetimeId) -> Result<()> {
        self.inner.lifetimes.finalize(node)
    }

    pub fn is_finalized(&self, node: LifetimeId) -> bool {
        self.inner.lifetimes.is_finalized(node)
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("now", &self.now())
            .field("config", &self.inner.config)
            .field("subscriptions", &self.subscription_count())
            .field("pending", &self.pending_notifications())
            .finish()
    }
}
