//! Controller side: post a directive and wait for the agent's answer.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::framing::{append_directive, validate_directive};
use crate::core::types::{Location, PollConfig, Version};
use crate::io::reader::DualPathReader;
use crate::io::resource::VersionedResource;
use crate::io::watcher::await_version_until;

/// Operator-facing hint attached to a lost compare-and-swap.
pub const CONFLICT_HINT: &str = "someone else changed the resource; retry";

pub fn commit_message(location: &Location) -> String {
    format!("Update {} via relay controller", location.path)
}

/// Result of [`ControllerSession::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The resource moved past the posted version; `body` is its full content.
    Changed { posted: Version, body: String },
    /// Nothing answered before the deadline. The directive stays posted.
    NoChange { posted: Version, elapsed: Duration },
}

/// Everything a controller needs for one resource.
pub struct ControllerSession<R> {
    resource: R,
    reader: DualPathReader,
    location: Location,
    poll: PollConfig,
}

impl<R: VersionedResource> ControllerSession<R> {
    pub fn new(resource: R, reader: DualPathReader, location: Location, poll: PollConfig) -> Self {
        Self {
            resource,
            reader,
            location,
            poll,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Append `directive` as the new last line and wait for the agent.
    ///
    /// A lost compare-and-swap surfaces as a `ResourceError::VersionConflict`
    /// in the error chain and is never retried here.
    #[instrument(skip_all, fields(location = %self.location))]
    pub fn send(&mut self, directive: &str) -> Result<SendOutcome> {
        let directive = validate_directive(directive)?;
        let baseline = self
            .resource
            .read(&self.location)
            .with_context(|| format!("read {}", self.location))?;
        let body = append_directive(&baseline.body, directive);

        let posted = match self.resource.write(
            &self.location,
            &body,
            &baseline.version,
            &commit_message(&self.location),
        ) {
            Ok(version) => version,
            Err(err) if err.is_conflict() => {
                return Err(anyhow::Error::new(err).context(CONFLICT_HINT));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("write {}", self.location));
            }
        };
        info!(posted = %posted, "directive posted");

        // A lagging reader may still serve the pre-write body, or older ones.
        let started = Instant::now();
        let deadline = started + self.poll.timeout();
        let mut known = vec![posted.clone(), baseline.version];
        loop {
            let Some(observed) = await_version_until(
                &mut self.reader,
                &self.location,
                &known,
                self.poll.interval(),
                deadline,
            ) else {
                let elapsed = started.elapsed();
                info!(elapsed_ms = elapsed.as_millis() as u64, "no change before deadline");
                return Ok(SendOutcome::NoChange { posted, elapsed });
            };

            match self.resource.read(&self.location) {
                Ok(current) if known.contains(&current.version) => {
                    debug!(observed = %observed.version, "change not confirmed");
                    known.push(observed.version);
                    continue;
                }
                Ok(current) => info!(version = %current.version, "resource changed"),
                Err(err) => warn!(%err, "confirming read failed, trusting poll"),
            }
            let body = match self.resource.read_full(&self.location) {
                Ok(body) => body,
                Err(err) => {
                    warn!(%err, "full read failed, using polled body");
                    observed.body
                }
            };
            return Ok(SendOutcome::Changed { posted, body });
        }
    }

    /// Full current body of the resource.
    pub fn show(&self) -> Result<String> {
        self.resource
            .read_full(&self.location)
            .with_context(|| format!("read {}", self.location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::version::git_blob_version;
    use crate::io::reader::{Authoritative, CacheEntry, FetchOutcome, FetchStrategy, ReadCache};
    use crate::io::resource::ResourceError;
    use crate::test_support::MemoryResource;

    fn location() -> Location {
        Location::new("octo", "notes", "README.md", "main")
    }

    fn session(resource: &MemoryResource, timeout_ms: u64) -> ControllerSession<MemoryResource> {
        let reader = DualPathReader::new(
            vec![Box::new(Authoritative::new(resource.clone()))],
            ReadCache::new(),
        );
        let poll = PollConfig::new(
            Duration::from_millis(100),
            Duration::from_millis(timeout_ms),
        )
        .expect("poll");
        ControllerSession::new(resource.clone(), reader, location(), poll)
    }

    #[test]
    fn send_appends_directive_and_times_out_without_agent() {
        let resource = MemoryResource::with_version("notes", "v1");
        let mut session = session(&resource, 300);

        let outcome = session.send("uptime").expect("send");

        assert_eq!(resource.body(), "notes\nuptime");
        assert_eq!(
            resource.commit_messages(),
            vec!["Update README.md via relay controller".to_string()]
        );
        match outcome {
            SendOutcome::NoChange { posted, elapsed } => {
                assert_eq!(posted, resource.version());
                assert!(elapsed >= Duration::from_millis(300));
            }
            other => panic!("expected no change, got {other:?}"),
        }
    }

    #[test]
    fn send_returns_body_written_after_directive() {
        let resource = MemoryResource::new("notes");
        let mut session = session(&resource, 3_000);

        let agent = resource.clone();
        let handle = std::thread::spawn(move || {
            // Answer once the directive is visible.
            loop {
                if agent.body().ends_with("\nuptime") {
                    agent.overwrite("notes\n\nCommand output:\nup 3 days\nuptime");
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        });

        let outcome = session.send("uptime").expect("send");
        handle.join().expect("agent thread");
        match outcome {
            SendOutcome::Changed { body, .. } => {
                assert_eq!(body, "notes\n\nCommand output:\nup 3 days\nuptime");
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    /// Always serves one old snapshot, like a mirror far behind.
    struct FrozenMirror(CacheEntry);

    impl FetchStrategy for FrozenMirror {
        fn name(&self) -> &'static str {
            "frozen"
        }

        fn fetch(
            &self,
            _location: &Location,
            _cached: Option<&CacheEntry>,
        ) -> Result<FetchOutcome, ResourceError> {
            Ok(FetchOutcome::Fresh(self.0.clone()))
        }
    }

    #[test]
    fn older_mirror_version_is_not_an_answer() {
        let resource = MemoryResource::new("notes");
        let old = CacheEntry {
            validator: None,
            version: git_blob_version("drafts"),
            body: "drafts".to_string(),
        };
        let reader = DualPathReader::new(vec![Box::new(FrozenMirror(old))], ReadCache::new());
        let poll = PollConfig::new(Duration::from_millis(100), Duration::from_millis(400))
            .expect("poll");
        let mut session = ControllerSession::new(resource.clone(), reader, location(), poll);

        let outcome = session.send("uptime").expect("send");
        assert!(
            matches!(outcome, SendOutcome::NoChange { .. }),
            "{outcome:?}"
        );
        assert_eq!(resource.body(), "notes\nuptime");
    }

    #[test]
    fn lost_race_is_reported_as_conflict() {
        let resource = MemoryResource::new("notes");
        resource.fail_next_write(ResourceError::VersionConflict {
            expected: Version::from("v1"),
            current: Some(Version::from("v2")),
        });
        let mut session = session(&resource, 300);

        let err = session.send("uptime").expect_err("conflict");
        assert!(
            err.downcast_ref::<ResourceError>()
                .is_some_and(ResourceError::is_conflict)
        );
        assert!(format!("{err:#}").starts_with(CONFLICT_HINT));
        assert_eq!(resource.body(), "notes");
    }

    #[test]
    fn multi_line_directive_is_rejected_before_any_io() {
        let resource = MemoryResource::new("notes");
        let mut session = session(&resource, 300);
        assert!(session.send("ls\nrm -rf /").is_err());
        assert_eq!(resource.reads(), 0);
        assert_eq!(resource.writes(), 0);
    }

    #[test]
    fn show_returns_full_body() {
        let resource = MemoryResource::new("a\nb");
        let session = session(&resource, 300);
        assert_eq!(session.show().expect("show"), "a\nb");
    }
}
