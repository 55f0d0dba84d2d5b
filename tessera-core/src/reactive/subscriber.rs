//! Subscriptions
//!
//! A subscription watches one dependency snapshot and calls back the first
//! time that snapshot goes stale. After firing it is dormant until it is
//! re-armed with a new snapshot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::context::DependencySnapshot;
use super::internals::ReactiveId;
use super::runtime::Timeline;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared state of a subscription, referenced from the timeline's registry.
pub(crate) struct SubscriptionState {
    id: SubscriptionId,
    /// The callback to invoke when the snapshot goes stale.
    callback: Box<dyn Fn() + Send + Sync>,
    snapshot: Mutex<DependencySnapshot>,
    /// Leaves this subscription is registered under.
    leaves: Mutex<IndexSet<ReactiveId>>,
    armed: AtomicBool,
    fired: AtomicU64,
    notify: Notify,
}

impl SubscriptionState {
    pub(crate) fn new<F>(callback: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: SubscriptionId::new(),
            callback: Box::new(callback),
            snapshot: Mutex::new(DependencySnapshot::default()),
            leaves: Mutex::new(IndexSet::new()),
            armed: AtomicBool::new(false),
            fired: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Install a new snapshot and return the leaves to watch.
    pub(crate) fn arm(&self, snapshot: DependencySnapshot) -> IndexSet<ReactiveId> {
        let leaves = snapshot.leaves();
        *self.snapshot.lock() = snapshot;
        *self.leaves.lock() = leaves.clone();
        self.armed.store(true, Ordering::SeqCst);
        leaves
    }

    /// Disarm if the snapshot has gone stale. Returns true exactly once per
    /// arming.
    pub(crate) fn trip(&self) -> bool {
        if !self.armed.load(Ordering::SeqCst) || !self.snapshot.lock().is_stale() {
            return false;
        }
        self.armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Stop watching and hand back the leaves to unregister from.
    pub(crate) fn take_leaves(&self) -> IndexSet<ReactiveId> {
        std::mem::take(&mut *self.leaves.lock())
    }

    pub(crate) fn deliver(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(subscription = ?self.id, "delivering invalidation");
        (self.callback)();
        self.notify.notify_one();
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("id", &self.id)
            .field("armed", &self.armed.load(Ordering::SeqCst))
            .field("fired", &self.fired.load(Ordering::SeqCst))
            .finish()
    }
}

/// A live subscription. Dropping it unregisters the callback.
///
/// Created by [`Timeline::subscribe`].
pub struct Subscription {
    state: Arc<SubscriptionState>,
    timeline: Timeline,
}

impl Subscription {
    pub(crate) fn new(timeline: Timeline, state: Arc<SubscriptionState>) -> Self {
        Self { state, timeline }
    }

    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }

    /// Whether the subscription is waiting for its snapshot to go stale.
    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::SeqCst)
    }

    /// How many times the callback has been invoked.
    pub fn fire_count(&self) -> u64 {
        self.state.fired.load(Ordering::SeqCst)
    }

    /// Wait until the next invalidation is delivered.
    ///
    /// An invalidation delivered while nobody is waiting is remembered, so
    /// the next call returns immediately.
    pub async fn invalidated(&self) {
        self.state.notify.notified().await;
    }

    /// Watch `snapshot` from now on, replacing whatever was watched before.
    pub(crate) fn rearm(&self, snapshot: DependencySnapshot) {
        self.timeline.arm(&self.state, snapshot);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.timeline.unsubscribe(&self.state);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("armed", &self.is_armed())
            .field("fire_count", &self.fire_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::context::track;
    use crate::reactive::internals::{Internals, LeafState};
    use crate::reactive::runtime::Revision;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscription_ids_are_unique() {
        let id1 = SubscriptionId::new();
        let id2 = SubscriptionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn trip_fires_once_per_arming() {
        let leaf = LeafState::new(Revision::new(1));
        let ((), snapshot) = track(|| Internals::leaf(&leaf).consume());

        let state = SubscriptionState::new(|| {});
        let leaves = state.arm(snapshot.clone());
        assert_eq!(leaves.len(), 1);

        // Not stale yet
        assert!(!state.trip());

        leaf.set_last_updated(Revision::new(2));
        assert!(state.trip());
        assert!(!state.trip());

        // Re-arming with the old (stale) snapshot trips again
        state.arm(snapshot);
        assert!(state.trip());
    }

    #[test]
    fn deliver_calls_callback() {
        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = called.clone();

        let state = SubscriptionState::new(move || {
            called_clone.fetch_add(1, Ordering::SeqCst);
        });

        state.deliver();
        state.deliver();
        assert_eq!(called.load(Ordering::SeqCst), 2);
        assert_eq!(state.fired.load(Ordering::SeqCst), 2);
    }
}
