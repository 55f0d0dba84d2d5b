//! Reactive Primitives
//!
//! This module implements the dependency-tracking engine: cells, formulas,
//! markers, resources and renderables, all driven by one [`Timeline`].
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. Reading it inside a tracking
//! frame records it, together with the revision it was last written at.
//! Writing a value the cell considers different advances the timeline.
//!
//! ## Formulas
//!
//! A Formula is a memoized derived value. It remembers the snapshot of what
//! it read and recomputes only when read again after one of those inputs
//! moved. Nothing is pushed to it.
//!
//! ## Markers
//!
//! A Marker is a dependency without a value, for wiring edges by hand.
//!
//! ## Resources
//!
//! A Resource pairs a constructor (run once per activation, with cleanups
//! attached to a lifetime node) with a formula built by that constructor.
//!
//! ## Renderables
//!
//! A Renderable pushes a single invalidation to a host whenever a formula's
//! snapshot goes stale, so the host knows when to pull again.
//!
//! # Implementation Notes
//!
//! Dependency tracking is a thread-local stack of frames. Reads record
//! *internals* (a leaf revision or a composite of parts), never values.
//! Validation compares recorded revisions against current ones, which is
//! why an equal write is invisible to every dependent.

mod cell;
mod context;
mod formula;
mod internals;
mod marker;
mod renderable;
mod resource;
mod runtime;
mod subscriber;

pub use cell::{Cell, Equality};
pub use context::{is_tracking, track, untracked, DependencySnapshot};
pub use formula::{Formula, FormulaStatus};
pub use internals::{CompositeInternals, Internals, Reactive, ReactiveId};
pub use marker::Marker;
pub use renderable::Renderable;
pub use resource::{Resource, ResourceBuilder};
pub use runtime::{NotifyMode, Revision, Timeline, TimelineConfig};
pub use subscriber::{Subscription, SubscriptionId};
