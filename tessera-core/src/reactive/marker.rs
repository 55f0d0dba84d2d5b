//! Markers
//!
//! A marker is a reactive leaf with no value. Consuming it records interest;
//! updating it invalidates everything that consumed it. It is used to wire
//! dependency edges that are not tied to stored data, such as "this resource
//! has been initialized".

use std::fmt;
use std::sync::Arc;

use super::internals::{Internals, LeafState, Reactive};
use super::runtime::{Revision, Timeline};

/// A valueless reactive dependency point.
///
/// Cloning a `Marker` creates a new handle to the **same** marker.
#[derive(Clone)]
pub struct Marker {
    leaf: Arc<LeafState>,
    timeline: Timeline,
}

impl Marker {
    pub fn new(timeline: &Timeline) -> Self {
        Self {
            leaf: LeafState::new(timeline.now()),
            timeline: timeline.clone(),
        }
    }

    /// Advance the marker's revision, invalidating everything that consumed
    /// it.
    pub fn update(&self) -> Revision {
        self.timeline.bump(&self.leaf)
    }

    /// The revision of the last update.
    pub fn revision(&self) -> Revision {
        self.leaf.last_updated()
    }
}

impl Reactive for Marker {
    fn internals(&self) -> Internals {
        Internals::leaf(&self.leaf)
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marker")
            .field("id", &self.leaf.id())
            .field("updated", &self.leaf.last_updated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::context::track;

    #[test]
    fn consume_records_the_marker() {
        let timeline = Timeline::new();
        let marker = Marker::new(&timeline);

        let ((), snapshot) = track(|| marker.consume());
        assert!(snapshot.contains(&marker));
        assert!(!snapshot.is_stale());

        marker.update();
        assert!(snapshot.is_stale());
    }

    #[test]
    fn update_always_advances() {
        let timeline = Timeline::new();
        let marker = Marker::new(&timeline);

        let first = marker.update();
        let second = marker.update();
        assert!(second > first);
        assert_eq!(marker.revision(), timeline.now());
    }
}
