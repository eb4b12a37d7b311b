//! The versioned resource seam.
//!
//! [`VersionedResource`] is everything the relay needs from remote storage:
//! a read that reports the current version and a compare-and-swap write.
//! Implementations classify failures into [`ResourceError`] so callers can
//! decide what to retry.

use thiserror::Error;

use crate::core::types::{Location, Snapshot, Version};

/// Failure taxonomy for resource access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Credentials missing or rejected. Never retried.
    #[error("authentication rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    /// Owner, repo, path or branch does not resolve. Never retried.
    #[error("{location} not found")]
    NotFound { location: String },

    /// `expected` is no longer the current version.
    #[error("version conflict: expected {expected} is stale{}", current_suffix(.current))]
    VersionConflict {
        expected: Version,
        current: Option<Version>,
    },

    /// Connectivity problem, rate limiting or a 5xx response.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The remote answered with something we cannot interpret.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ResourceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ResourceError::VersionConflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ResourceError::Transient(_))
    }
}

fn current_suffix(current: &Option<Version>) -> String {
    match current {
        Some(version) => format!(" (current {version})"),
        None => String::new(),
    }
}

/// Remote text blob with optimistic concurrency.
pub trait VersionedResource {
    /// Fetch the current version and body.
    fn read(&self, location: &Location) -> Result<Snapshot, ResourceError>;

    /// Replace the body if `expected` is still current; returns the new version.
    fn write(
        &self,
        location: &Location,
        body: &str,
        expected: &Version,
        message: &str,
    ) -> Result<Version, ResourceError>;

    /// Fetch the complete body, bypassing any size-limited representation.
    fn read_full(&self, location: &Location) -> Result<String, ResourceError> {
        self.read(location).map(|snapshot| snapshot.body)
    }
}

impl<R: VersionedResource + ?Sized> VersionedResource for &R {
    fn read(&self, location: &Location) -> Result<Snapshot, ResourceError> {
        (**self).read(location)
    }

    fn write(
        &self,
        location: &Location,
        body: &str,
        expected: &Version,
        message: &str,
    ) -> Result<Version, ResourceError> {
        (**self).write(location, body, expected, message)
    }

    fn read_full(&self, location: &Location) -> Result<String, ResourceError> {
        (**self).read_full(location)
    }
}
