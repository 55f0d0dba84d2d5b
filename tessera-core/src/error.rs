//! Error types for tessera-core.

use std::fmt;

use thiserror::Error;

use crate::graph::LifetimeId;

/// Boxed error used for user-supplied failures (fallible finalizers and
/// resource constructors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for tessera-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera-core.
#[derive(Debug, Error)]
pub enum Error {
    /// A cleanup or child link was registered on a lifetime that has already
    /// been finalized.
    #[error("lifetime {0} has already been finalized")]
    AlreadyFinalized(LifetimeId),

    /// The lifetime was not issued by this timeline.
    #[error("unknown lifetime {0}")]
    UnknownLifetime(LifetimeId),

    /// One or more finalizers failed during a finalize pass.
    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    /// Attempted to write a frozen cell.
    #[error("cannot write a frozen cell")]
    FrozenCell,

    /// The resource's own lifetime has been finalized.
    #[error("resource has been finalized")]
    ResourceFinalized,

    /// A resource constructor body failed.
    #[error("resource constructor failed: {0}")]
    Constructor(#[source] BoxError),
}

impl Error {
    /// Wrap an arbitrary error as a resource constructor failure.
    pub fn constructor<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Constructor(error.into())
    }

    /// Whether this is an ordering error (registration after finalization).
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::AlreadyFinalized(_))
    }
}

/// A single finalizer that failed during a finalize pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerFailure {
    /// The lifetime the finalizer was registered on.
    pub lifetime: LifetimeId,
    /// Registration index of the finalizer on that lifetime.
    pub index: usize,
    /// The error message, or the panic payload if the finalizer panicked.
    pub message: String,
}

impl fmt::Display for FinalizerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "finalizer #{} on lifetime {}: {}",
            self.index, self.lifetime, self.message
        )
    }
}

/// Every finalizer failure collected during one finalize pass.
///
/// The pass itself always runs to completion; this only reports what went
/// wrong along the way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} finalizer(s) failed: {}", .failures.len(), render(.failures))]
pub struct FinalizeError {
    pub failures: Vec<FinalizerFailure>,
}

impl FinalizeError {
    /// Failures in the order the finalizers ran.
    pub fn failures(&self) -> &[FinalizerFailure] {
        &self.failures
    }
}

fn render(failures: &[FinalizerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
