//! Renderables
//!
//! The bridge from the lazy pull model to a host that wants to be pushed.
//!
//! A host subscribes to a formula. The subscription reads the formula once,
//! watches the leaves behind the resulting snapshot, and calls back the
//! first time any of them moves the snapshot's fingerprint. It never
//! recomputes the formula; the host does that when it next reads.
//!
//! ```text
//! subscribe --read--> armed --leaf write--> callback --> dormant
//!                       ^                                   |
//!                       +------------- poll (re-read) ------+
//! ```

use std::fmt;

use super::context::{capture, DependencySnapshot};
use super::formula::Formula;
use super::internals::Reactive;
use super::runtime::Timeline;
use super::subscriber::{Subscription, SubscriptionState};

impl Timeline {
    /// Read `formula` once and call `on_invalidate` the first time its value
    /// may have changed.
    ///
    /// The subscription fires at most once, then stays dormant until it is
    /// re-armed. [`Renderable`] does the re-arming for you.
    pub fn subscribe<T, F>(&self, formula: &Formula<T>, on_invalidate: F) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let ((), snapshot) = capture(|| {
            formula.read();
        });
        self.subscribe_snapshot(snapshot, on_invalidate)
    }

    /// Call `on_invalidate` the first time `value`'s fingerprint moves past
    /// its current revision. Nothing is read or recomputed.
    pub fn watch<R, F>(&self, value: &R, on_invalidate: F) -> Subscription
    where
        R: Reactive + ?Sized,
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe_snapshot(DependencySnapshot::of(value.internals()), on_invalidate)
    }

    fn subscribe_snapshot<F>(&self, snapshot: DependencySnapshot, on_invalidate: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let state = SubscriptionState::new(on_invalidate);
        self.register(&state);
        self.arm(&state, snapshot);

        tracing::debug!(subscription = ?state.id(), "subscribed");
        Subscription::new(self.clone(), state)
    }
}

/// A formula paired with a subscription that follows it.
///
/// Each [`poll`](Renderable::poll) reads the current value and re-arms the
/// subscription on the snapshot that read produced.
pub struct Renderable<T> {
    formula: Formula<T>,
    subscription: Subscription,
}

impl<T> Renderable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(timeline: &Timeline, formula: Formula<T>, on_invalidate: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let subscription = timeline.subscribe(&formula, on_invalidate);
        Self {
            formula,
            subscription,
        }
    }

    /// Read the current value and watch the snapshot it came from.
    pub fn poll(&self) -> T {
        let (value, snapshot) = capture(|| self.formula.read());
        self.subscription.rearm(snapshot);
        value
    }

    /// Wait for the next invalidation, then read.
    pub async fn next(&self) -> T {
        self.subscription.invalidated().await;
        self.poll()
    }

    pub fn formula(&self) -> &Formula<T> {
        &self.formula
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl<T> fmt::Debug for Renderable<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderable")
            .field("formula", &self.formula)
            .field("subscription", &self.subscription)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::cell::Cell;
    use crate::reactive::formula::FormulaStatus;
    use crate::reactive::marker::Marker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn subscribe_fires_once_and_does_not_recompute() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 1);
        let c = cell.clone();
        let formula = Formula::new(move || c.read() * 2);

        let (fired, callback) = counter();
        let subscription = timeline.subscribe(&formula, callback);
        assert_eq!(formula.recompute_count(), 1);

        cell.write(2);
        cell.write(3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!subscription.is_armed());
        assert_eq!(formula.status(), FormulaStatus::Stale);
        assert_eq!(formula.recompute_count(), 1);
    }

    #[test]
    fn equal_write_does_not_fire() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 1);
        let c = cell.clone();
        let formula = Formula::new(move || c.read());

        let (fired, callback) = counter();
        let _subscription = timeline.subscribe(&formula, callback);

        cell.write(1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn poll_rearms_on_the_new_snapshot() {
        let timeline = Timeline::new();
        let flag = Cell::new(&timeline, true);
        let a = Cell::new(&timeline, 1);
        let b = Cell::new(&timeline, 2);

        let (f, x, y) = (flag.clone(), a.clone(), b.clone());
        let formula = Formula::new(move || if f.read() { x.read() } else { y.read() });

        let (fired, callback) = counter();
        let renderable = Renderable::new(&timeline, formula, callback);

        // Untaken branch
        b.write(20);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        flag.write(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(renderable.poll(), 20);
        assert!(renderable.subscription().is_armed());

        // `a` is no longer read
        a.write(10);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        b.write(30);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(renderable.poll(), 30);
    }

    #[test]
    fn batch_fires_once_per_transaction() {
        let timeline = Timeline::new();
        let a = Cell::new(&timeline, 1);
        let b = Cell::new(&timeline, 2);
        let (x, y) = (a.clone(), b.clone());
        let formula = Formula::new(move || x.read() + y.read());

        let (fired, callback) = counter();
        let renderable = Renderable::new(&timeline, formula, callback);

        timeline.batch(|| {
            a.write(10);
            b.write(20);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(renderable.poll(), 30);
    }

    #[test]
    fn watch_follows_a_marker() {
        let timeline = Timeline::new();
        let marker = Marker::new(&timeline);

        let (fired, callback) = counter();
        let _subscription = timeline.watch(&marker, callback);

        marker.update();
        marker.update();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_renderable_unsubscribes() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 1);
        let c = cell.clone();

        let (fired, callback) = counter();
        let renderable = Renderable::new(&timeline, Formula::new(move || c.read()), callback);
        assert_eq!(timeline.subscription_count(), 1);

        drop(renderable);
        assert_eq!(timeline.subscription_count(), 0);

        cell.write(2);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidated_wakes_an_async_host() {
        let timeline = Timeline::new();
        let cell = Cell::new(&timeline, 1);
        let c = cell.clone();
        let renderable = Renderable::new(&timeline, Formula::new(move || c.read() * 10), || {});

        let host = renderable.next();
        let writer = async {
            tokio::task::yield_now().await;
            cell.write(4);
        };

        let (value, ()) = tokio::join!(host, writer);
        assert_eq!(value, 40);
    }
}
