//! Lifetime Graph
//!
//! This module implements the finalization graph that ties constructed
//! objects to their cleanup actions and to the child objects they own.
//!
//! # Overview
//!
//! The graph is a set of nodes identified by [`LifetimeId`]:
//!
//! - Each node owns a list of finalizers (cleanup callbacks)
//! - Each node owns a list of linked children
//! - An edge from A to B means "finalizing A finalizes B"
//!
//! Nodes may be shared: a child linked under several parents is finalized by
//! whichever parent is finalized first, and never again.
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena indexed by id rather than pointing at each other.
//!    Parent/child cycles are harmless: a finalized node is never walked twice.
//!
//! 2. Finalizers and children run in registration order. This is a guarantee,
//!    not an accident of the container.
//!
//! 3. A finalized node leaves the arena. Ids are issued in sequence, so a
//!    late registration on an issued id that is gone is still rejected with
//!    an ordering error.

mod lifetime;
mod node;

pub use lifetime::{LifetimeGraph, Unlink};
pub use node::LifetimeId;
