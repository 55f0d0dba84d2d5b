//! Resource Implementation
//!
//! A Resource is a two-level formula:
//!
//! - The **constructor** body runs once per activation. It may set up side
//!   effects, register cleanups and link child lifetimes through a
//!   [`ResourceBuilder`], and returns the inner computation.
//! - The **inner formula** wraps that computation. It is stateless with
//!   respect to lifetimes and can be read any number of times.
//!
//! # How Resources Work
//!
//! A resource is a state machine:
//!
//! ```text
//! Unactivated --read--> Active --(constructor deps stale) read--> Active
//!      |                  |
//!      +----finalize------+-------------------------------------> Finalized
//! ```
//!
//! 1. Nothing runs at construction. The first read bumps the resource's
//!    "initialized" marker and activates it.
//!
//! 2. Activation creates a fresh lifetime node, runs the constructor inside a
//!    tracking frame (capturing the *creation* snapshot), wraps the returned
//!    closure in a formula, and links the node under the resource's own
//!    lifetime.
//!
//! 3. While the creation snapshot is valid, reads go straight to the inner
//!    formula. Changes to what the inner formula reads never re-run the
//!    constructor.
//!
//! 4. Once the creation snapshot goes stale, the next read finalizes the
//!    previous activation's node (running its cleanups and children) before
//!    the constructor runs again. There is at most one live activation.
//!
//! 5. Finalizing the resource's own lifetime tears down the live activation
//!    and moves the resource to `Finalized`; later reads fail. Dropping the
//!    last handle does the same.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::context::{capture, untracked, DependencySnapshot};
use super::formula::Formula;
use super::internals::{CompositeInternals, Internals, Reactive};
use super::marker::Marker;
use super::runtime::Timeline;
use crate::error::{BoxError, Error, Result};
use crate::graph::{LifetimeId, Unlink};

type Definition<T> = Box<dyn Fn() -> T + Send + Sync>;
type Constructor<T> = Box<dyn Fn(&mut ResourceBuilder) -> Result<Definition<T>> + Send + Sync>;

/// The surface a constructor body uses to attach effects to its activation.
///
/// Everything registered here is torn down when the activation is replaced
/// or the resource is finalized.
#[derive(Debug)]
pub struct ResourceBuilder {
    timeline: Timeline,
    lifetime: LifetimeId,
}

impl ResourceBuilder {
    /// Run `cleanup` when this activation ends.
    pub fn on_cleanup<F>(&mut self, cleanup: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.timeline.on_cleanup(self.lifetime, cleanup)
    }

    /// Run a fallible `cleanup` when this activation ends.
    pub fn try_on_cleanup<F, E>(&mut self, cleanup: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.timeline.try_on_cleanup(self.lifetime, cleanup)
    }

    /// Finalize `child` when this activation ends.
    pub fn link(&mut self, child: LifetimeId) -> Result<Unlink> {
        self.timeline.link(self.lifetime, child)
    }

    /// The activation's lifetime node.
    pub fn lifetime(&self) -> LifetimeId {
        self.lifetime
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }
}

struct Activation<T> {
    creation: DependencySnapshot,
    formula: Formula<T>,
    lifetime: LifetimeId,
    link: Unlink,
}

enum ResourceState<T> {
    Unactivated,
    Active(Activation<T>),
    Finalized,
}

struct ResourceInner<T> {
    timeline: Timeline,
    constructor: Constructor<T>,
    /// Bumps on first activation, so consumers can invalidate without forcing
    /// the resource to compute.
    initialized: Marker,
    ever_activated: AtomicBool,
    own: LifetimeId,
    state: Mutex<ResourceState<T>>,
    composite: CompositeInternals,
    activations: AtomicU64,
}

/// A constructor/formula pair bounded by a lifetime.
///
/// Cloning a `Resource` creates a new handle to the **same** resource.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use tessera_core::{Cell, Resource, Timeline};
///
/// let timeline = Timeline::new();
/// let url = Cell::new(&timeline, "a".to_string());
/// let closed = Arc::new(AtomicUsize::new(0));
///
/// let (u, c) = (url.clone(), closed.clone());
/// let connection = Resource::new(&timeline, move |build| {
///     let target = u.read();
///     let c = c.clone();
///     build.on_cleanup(move || {
///         c.fetch_add(1, Ordering::SeqCst);
///     })?;
///     Ok(move || format!("connected to {target}"))
/// });
///
/// assert_eq!(connection.read().unwrap(), "connected to a");
/// url.write("b".to_string());
/// assert_eq!(connection.read().unwrap(), "connected to b");
/// assert_eq!(closed.load(Ordering::SeqCst), 1);
/// ```
pub struct Resource<T> {
    inner: Arc<ResourceInner<T>>,
}

impl<T> Resource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an inert resource. The constructor does not run until the
    /// first read.
    pub fn new<B, F>(timeline: &Timeline, constructor: B) -> Self
    where
        B: Fn(&mut ResourceBuilder) -> Result<F> + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let constructor: Constructor<T> =
            Box::new(move |build| constructor(build).map(|f| Box::new(f) as Definition<T>));
        let initialized = Marker::new(timeline);

        let inner = Arc::new_cyclic(|weak: &Weak<ResourceInner<T>>| {
            let weak = weak.clone();
            let own = timeline.lifetimes().create_with(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.retire();
                }
                Ok(())
            }));

            ResourceInner {
                timeline: timeline.clone(),
                constructor,
                composite: CompositeInternals::new([initialized.internals()]),
                initialized,
                ever_activated: AtomicBool::new(false),
                own,
                state: Mutex::new(ResourceState::Unactivated),
                activations: AtomicU64::new(0),
            }
        });

        Self { inner }
    }

    /// Read the current value, activating or re-activating first if needed.
    ///
    /// Records the resource's internals in the current frame.
    pub fn read(&self) -> Result<T> {
        let value = self.validate()?;
        self.consume();
        Ok(value)
    }

    fn validate(&self) -> Result<T> {
        let mut state = self.inner.state.lock();
        match &*state {
            ResourceState::Finalized => return Err(Error::ResourceFinalized),
            ResourceState::Active(activation) if !activation.creation.is_stale() => {
                let formula = activation.formula.clone();
                drop(state);
                return Ok(Self::evaluate(&formula));
            }
            _ => {}
        }

        let previous = std::mem::replace(&mut *state, ResourceState::Unactivated);
        drop(state);

        if let ResourceState::Active(activation) = previous {
            self.deactivate(activation);
        } else if !self.inner.ever_activated.swap(true, Ordering::SeqCst) {
            self.inner.initialized.update();
        }

        let formula = self.activate()?;
        Ok(Self::evaluate(&formula))
    }

    /// The enclosing frame sees the resource's composite, which already
    /// covers the inner formula.
    fn evaluate(formula: &Formula<T>) -> T {
        untracked(|| formula.read())
    }

    fn activate(&self) -> Result<Formula<T>> {
        let timeline = &self.inner.timeline;
        let lifetime = timeline.create_lifetime();
        let mut builder = ResourceBuilder {
            timeline: timeline.clone(),
            lifetime,
        };

        tracing::debug!(resource = %self.inner.own, activation = %lifetime, "activating resource");

        let (built, creation) = capture(|| (self.inner.constructor)(&mut builder));
        let definition = match built {
            Ok(definition) => definition,
            Err(error) => {
                self.discard(lifetime);
                return Err(error);
            }
        };

        let link = match timeline.link(self.inner.own, lifetime) {
            Ok(link) => link,
            Err(Error::AlreadyFinalized(_)) => {
                self.discard(lifetime);
                return Err(Error::ResourceFinalized);
            }
            Err(error) => {
                self.discard(lifetime);
                return Err(error);
            }
        };

        let formula = Formula::new(definition);

        let mut parts = vec![self.inner.initialized.internals()];
        parts.extend(creation.internals().cloned());
        parts.push(formula.internals());
        self.inner.composite.set_parts(parts);

        let mut state = self.inner.state.lock();
        if matches!(*state, ResourceState::Finalized) {
            drop(state);
            link.unlink();
            self.discard(lifetime);
            return Err(Error::ResourceFinalized);
        }

        *state = ResourceState::Active(Activation {
            creation,
            formula: formula.clone(),
            lifetime,
            link,
        });
        self.inner.activations.fetch_add(1, Ordering::SeqCst);

        Ok(formula)
    }

    /// Tear down a superseded activation.
    fn deactivate(&self, activation: Activation<T>) {
        tracing::debug!(
            resource = %self.inner.own,
            activation = %activation.lifetime,
            "constructor dependencies changed, replacing activation"
        );

        activation.link.unlink();
        if let Err(error) = self.inner.timeline.finalize(activation.lifetime) {
            // Each failure was already logged by the finalize pass; the new
            // activation goes ahead regardless.
            tracing::warn!(resource = %self.inner.own, %error, "previous activation finalized with errors");
        }
    }

    /// Finalize an activation that never became live.
    fn discard(&self, lifetime: LifetimeId) {
        if let Err(error) = self.inner.timeline.finalize(lifetime) {
            tracing::warn!(resource = %self.inner.own, %error, "discarded activation finalized with errors");
        }
    }

    /// Link this resource under `owner`, so finalizing the owner finalizes
    /// the resource.
    pub fn link_to(&self, owner: LifetimeId) -> Result<Unlink> {
        self.inner.timeline.link(owner, self.inner.own)
    }

    /// Finalize the resource and its live activation.
    pub fn finalize(&self) -> Result<()> {
        self.inner.timeline.finalize(self.inner.own)
    }

    /// The resource's own lifetime node.
    pub fn lifetime(&self) -> LifetimeId {
        self.inner.own
    }

    /// Lifetime node of the live activation, if any.
    pub fn activation_lifetime(&self) -> Option<LifetimeId> {
        match &*self.inner.state.lock() {
            ResourceState::Active(activation) => Some(activation.lifetime),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.inner.state.lock(), ResourceState::Active(_))
    }

    pub fn is_finalized(&self) -> bool {
        matches!(*self.inner.state.lock(), ResourceState::Finalized)
    }

    /// How many times the constructor has completed an activation.
    pub fn activation_count(&self) -> u64 {
        self.inner.activations.load(Ordering::SeqCst)
    }
}

impl<T> ResourceInner<T> {
    /// Own lifetime finalized: drop the activation. Its node is a child of
    /// ours and is finalized right after this runs.
    fn retire(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), ResourceState::Finalized);
        drop(previous);
        tracing::debug!(resource = %self.own, "resource finalized");
    }
}

impl<T> Drop for ResourceInner<T> {
    /// The last handle is gone, so nothing can read the resource again.
    /// Its own node and the live activation leave the lifetime graph.
    fn drop(&mut self) {
        if let Err(error) = self.timeline.finalize(self.own) {
            tracing::warn!(resource = %self.own, %error, "dropped resource finalized with errors");
        }
    }
}

impl<T> Reactive for Resource<T> {
    fn internals(&self) -> Internals {
        self.inner.composite.internals()
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            ResourceState::Unactivated => "unactivated",
            ResourceState::Active(_) => "active",
            ResourceState::Finalized => "finalized",
        };
        f.debug_struct("Resource")
            .field("lifetime", &self.inner.own)
            .field("state", &state)
            .field("activations", &self.inner.activations.load(Ordering::SeqCst))
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
    use std::sync::atomic::AtomicUsize;

    struct Counters {
        constructed: Arc<AtomicUsize>,
        cleaned: Arc<AtomicUsize>,
    }

    fn counted(timeline: &Timeline, input: &Cell<i32>) -> (Resource<i32>, Counters) {
        let counters = Counters {
            constructed: Arc::new(AtomicUsize::new(0)),
            cleaned: Arc::new(AtomicUsize::new(0)),
        };

        let (constructed, cleaned) = (counters.constructed.clone(), counters.cleaned.clone());
        let input = input.clone();
        let resource = Resource::new(timeline, move |build| {
            constructed.fetch_add(1, Ordering::SeqCst);
            let base = input.read();
            let cleaned = cleaned.clone();
            build.on_cleanup(move || {
                cleaned.fetch_add(1, Ordering::SeqCst);
            })?;
            Ok(move || base * 10)
        });

        (resource, counters)
    }

    #[test]
    fn resource_is_inert_until_read() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, counters) = counted(&timeline, &input);

        assert!(!resource.is_active());
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);

        assert_eq!(resource.read().unwrap(), 10);
        assert!(resource.is_active());
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reading_without_changes_never_reconstructs() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, counters) = counted(&timeline, &input);

        for _ in 0..5 {
            assert_eq!(resource.read().unwrap(), 10);
        }
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_constructor_replaces_activation() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, counters) = counted(&timeline, &input);

        resource.read().unwrap();
        let first = resource.activation_lifetime().unwrap();

        input.write(2);
        // Nothing happens until the next read
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 0);

        assert_eq!(resource.read().unwrap(), 20);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(counters.constructed.load(Ordering::SeqCst), 2);
        assert!(timeline.is_finalized(first));
        assert_ne!(resource.activation_lifetime(), Some(first));
        assert_eq!(timeline.lifetimes().children(resource.lifetime()).len(), 1);
    }

    #[test]
    fn inner_dependencies_do_not_reconstruct() {
        let timeline = Timeline::new();
        let setup = Cell::new(&timeline, 1);
        let live = Cell::new(&timeline, 5);
        let constructed = Arc::new(AtomicUsize::new(0));

        let (s, l, c) = (setup.clone(), live.clone(), constructed.clone());
        let resource = Resource::new(&timeline, move |_build| {
            c.fetch_add(1, Ordering::SeqCst);
            let factor = s.read();
            let l = l.clone();
            Ok(move || l.read() * factor)
        });

        assert_eq!(resource.read().unwrap(), 5);
        live.write(6);
        assert_eq!(resource.read().unwrap(), 6);
        assert_eq!(constructed.load(Ordering::SeqCst), 1);

        setup.write(2);
        assert_eq!(resource.read().unwrap(), 12);
        assert_eq!(constructed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn finalizing_the_resource_tears_down_and_blocks_reads() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, counters) = counted(&timeline, &input);

        resource.read().unwrap();
        resource.finalize().unwrap();

        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
        assert!(resource.is_finalized());
        assert!(matches!(resource.read(), Err(Error::ResourceFinalized)));

        // Idempotent
        resource.finalize().unwrap();
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn owner_finalization_cascades() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, counters) = counted(&timeline, &input);

        let owner = timeline.create_lifetime();
        resource.link_to(owner).unwrap();
        resource.read().unwrap();

        timeline.finalize(owner).unwrap();
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
        assert!(resource.is_finalized());
    }

    #[test]
    fn failed_constructor_cleans_up_and_retries() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, -1);
        let cleaned = Arc::new(AtomicUsize::new(0));

        let (i, c) = (input.clone(), cleaned.clone());
        let resource = Resource::new(&timeline, move |build| {
            let c = c.clone();
            build.on_cleanup(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })?;
            let value = i.read();
            if value < 0 {
                return Err(Error::constructor(format!("bad input {value}")));
            }
            Ok(move || value)
        });

        let error = resource.read().unwrap_err();
        assert!(error.to_string().contains("bad input -1"));
        // The cleanup registered before the failure ran
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(!resource.is_active());

        input.write(3);
        assert_eq!(resource.read().unwrap(), 3);
        assert_eq!(resource.activation_count(), 1);
    }

    #[test]
    fn linked_children_end_with_the_activation() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let child = timeline.create_lifetime();

        let i = input.clone();
        let resource = Resource::new(&timeline, move |build| {
            let value = i.read();
            build.link(child)?;
            Ok(move || value)
        });

        resource.read().unwrap();
        assert!(!timeline.is_finalized(child));

        input.write(2);
        resource.read().unwrap();
        assert!(timeline.is_finalized(child));
    }

    #[test]
    fn first_activation_bumps_the_initialized_marker() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, _counters) = counted(&timeline, &input);

        let before = resource.last_updated();
        resource.read().unwrap();
        assert!(resource.last_updated() > before);
    }

    #[test]
    fn reactivation_does_not_grow_the_lifetime_graph() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 0);
        let (resource, counters) = counted(&timeline, &input);

        resource.read().unwrap();
        let live = timeline.lifetimes().len();
        assert_eq!(live, 2);

        for value in 1..=1000 {
            input.write(value);
            assert_eq!(resource.read().unwrap(), value * 10);
        }

        assert_eq!(counters.constructed.load(Ordering::SeqCst), 1001);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1000);
        assert_eq!(timeline.lifetimes().len(), live);
    }

    #[test]
    fn dropping_the_last_handle_finalizes() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);
        let (resource, counters) = counted(&timeline, &input);

        resource.read().unwrap();
        let own = resource.lifetime();
        let handle = resource.clone();

        drop(resource);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 0);
        assert!(!timeline.is_finalized(own));

        drop(handle);
        assert_eq!(counters.cleaned.load(Ordering::SeqCst), 1);
        assert!(timeline.is_finalized(own));
        assert!(timeline.lifetimes().is_empty());
    }

    #[test]
    fn dropping_an_unread_resource_releases_its_node() {
        let timeline = Timeline::new();
        let input = Cell::new(&timeline, 1);

        for _ in 0..100 {
            let (resource, counters) = counted(&timeline, &input);
            drop(resource);
            assert_eq!(counters.constructed.load(Ordering::SeqCst), 0);
        }
        assert!(timeline.lifetimes().is_empty());
    }
}
