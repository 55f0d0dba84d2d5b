//! Tessera Core
//!
//! This crate provides the dependency-tracking and invalidation engine for
//! the Tessera reactive runtime. It implements:
//!
//! - Mutable leaves ([`Cell`], [`Marker`]) stamped by a logical clock
//! - Lazily revalidated, memoized derivations ([`Formula`])
//! - A lifetime graph for deterministic, ordered teardown
//! - Constructor/formula pairs bounded by a lifetime ([`Resource`])
//! - A push bridge for external render schedulers ([`Renderable`])
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: Reactive primitives, tracking frames and the [`Timeline`]
//! - `graph`: The lifetime / finalization graph
//!
//! # Example
//!
//! ```rust
//! use tessera_core::{Cell, Formula, Timeline};
//!
//! let timeline = Timeline::new();
//! let count = Cell::new(&timeline, 1);
//!
//! let c = count.clone();
//! let doubled = Formula::new(move || c.read() * 2);
//!
//! assert_eq!(doubled.read(), 2);
//!
//! count.write(3);
//! // Recomputed on demand
//! assert_eq!(doubled.read(), 6);
//! assert_eq!(doubled.recompute_count(), 2);
//! ```

pub mod graph;
pub mod reactive;

mod error;

pub use error::{BoxError, Error, FinalizeError, FinalizerFailure, Result};
pub use graph::{LifetimeGraph, LifetimeId, Unlink};
pub use reactive::{
    is_tracking, track, untracked, Cell, CompositeInternals, DependencySnapshot, Equality,
    Formula, FormulaStatus, Internals, Marker, NotifyMode, Reactive, ReactiveId, Renderable,
    Resource, ResourceBuilder, Revision, Subscription, SubscriptionId, Timeline, TimelineConfig,
};
