//! Shared value types for the relay protocol.
//!
//! These types carry no I/O and compare by value, so the controller and the
//! agent can reason about the same resource without sharing any state.

use std::fmt;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Lowest polling interval accepted anywhere in the relay.
pub const MIN_INTERVAL_MS: u64 = 100;

/// Grace added to the controller's poll interval to form its wait deadline.
pub const CONTROLLER_GRACE_MS: u64 = 5_000;

/// Address of the shared text resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub branch: String,
}

impl Location {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            path: path.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}@{}",
            self.owner, self.repo, self.path, self.branch
        )
    }
}

/// Opaque content version. Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Resource state observed at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: Version,
    pub body: String,
}

/// Polling cadence and the overall deadline for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    interval: Duration,
    timeout: Duration,
}

impl PollConfig {
    /// Build a poll config with an explicit deadline.
    ///
    /// Rejects intervals below [`MIN_INTERVAL_MS`] and timeouts shorter than one interval.
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self> {
        if interval < Duration::from_millis(MIN_INTERVAL_MS) {
            bail!(
                "poll interval {}ms is below the {MIN_INTERVAL_MS}ms floor",
                interval.as_millis()
            );
        }
        if timeout < interval {
            bail!(
                "poll timeout {}ms is shorter than the interval {}ms",
                timeout.as_millis(),
                interval.as_millis()
            );
        }
        Ok(Self { interval, timeout })
    }

    /// Controller wait: the deadline is always the interval plus a fixed grace.
    pub fn for_controller(interval_ms: u64) -> Result<Self> {
        Self::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(interval_ms.saturating_add(CONTROLLER_GRACE_MS)),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_timeout_adds_fixed_grace() {
        let poll = PollConfig::for_controller(100).expect("poll");
        assert_eq!(poll.interval(), Duration::from_millis(100));
        assert_eq!(poll.timeout(), Duration::from_millis(5_100));
    }

    #[test]
    fn interval_below_floor_is_rejected() {
        let err = PollConfig::for_controller(99).unwrap_err();
        assert!(err.to_string().contains("below the 100ms floor"));
    }

    #[test]
    fn timeout_shorter_than_interval_is_rejected() {
        let err =
            PollConfig::new(Duration::from_millis(500), Duration::from_millis(200)).unwrap_err();
        assert!(err.to_string().contains("shorter than the interval"));
    }

    #[test]
    fn location_display_names_every_part() {
        let location = Location::new("octo", "notes", "README.md", "main");
        assert_eq!(location.to_string(), "octo/notes:README.md@main");
    }
}
