//! Client-driven polling for version changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace};

use crate::core::types::{Location, PollConfig, Snapshot, Version};
use crate::io::reader::DualPathReader;

/// How a bounded wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The resource moved away from the baseline.
    Changed(Snapshot),
    /// The deadline passed without a change. Not an error.
    Timeout { elapsed: Duration },
}

/// Poll until the version differs from `baseline` or `poll.timeout()` elapses.
///
/// Read errors are swallowed; only elapsed time ends the wait. The final sleep
/// is clipped to the deadline, so `Timeout` is never reported early and at most
/// one read latency late.
#[instrument(skip_all, fields(location = %location, baseline = %baseline))]
pub fn await_change(
    reader: &mut DualPathReader,
    location: &Location,
    baseline: &Version,
    poll: &PollConfig,
) -> WatchOutcome {
    await_version_outside(reader, location, std::slice::from_ref(baseline), poll)
}

/// Like [`await_change`], but every version in `known` counts as unchanged.
///
/// A lagging reader can still serve a version older than the baseline; listing
/// it here keeps that stale read from passing as a change.
pub fn await_version_outside(
    reader: &mut DualPathReader,
    location: &Location,
    known: &[Version],
    poll: &PollConfig,
) -> WatchOutcome {
    let started = Instant::now();
    match await_version_until(reader, location, known, poll.interval(), started + poll.timeout()) {
        Some(snapshot) => WatchOutcome::Changed(snapshot),
        None => {
            let elapsed = started.elapsed();
            debug!(elapsed_ms = elapsed.as_millis() as u64, "no change before deadline");
            WatchOutcome::Timeout { elapsed }
        }
    }
}

/// Poll every `interval` for a version outside `known`; `None` once `deadline` passes.
pub fn await_version_until(
    reader: &mut DualPathReader,
    location: &Location,
    known: &[Version],
    interval: Duration,
    deadline: Instant,
) -> Option<Snapshot> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        thread::sleep(interval.min(remaining));
        if let Some(snapshot) = poll_once(reader, location, known) {
            return Some(snapshot);
        }
    }
}

/// Poll every `interval` until the version differs from `baseline`.
///
/// Returns `None` once `stop` is set; the flag is checked before every sleep.
#[instrument(skip_all, fields(location = %location, baseline = %baseline))]
pub fn await_change_until_stopped(
    reader: &mut DualPathReader,
    location: &Location,
    baseline: &Version,
    interval: Duration,
    stop: &AtomicBool,
) -> Option<Snapshot> {
    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        thread::sleep(interval);
        if let Some(snapshot) = poll_once(reader, location, std::slice::from_ref(baseline)) {
            return Some(snapshot);
        }
    }
}

fn poll_once(
    reader: &mut DualPathReader,
    location: &Location,
    known: &[Version],
) -> Option<Snapshot> {
    match reader.fetch_current(location) {
        Ok(fetched) if !known.contains(&fetched.snapshot.version) => {
            debug!(
                version = %fetched.snapshot.version,
                source = fetched.source,
                "change observed"
            );
            Some(fetched.snapshot)
        }
        Ok(_) => {
            trace!("unchanged");
            None
        }
        Err(err) => {
            debug!(%err, "poll read failed, continuing");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::version::git_blob_version;
    use crate::io::reader::{CacheEntry, FetchOutcome, FetchStrategy, ReadCache};
    use crate::io::resource::ResourceError;

    /// Serves a fixed body, failing every other call.
    struct Flaky {
        body: Arc<Mutex<String>>,
        calls: Arc<Mutex<u32>>,
    }

    impl FetchStrategy for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn fetch(
            &self,
            _location: &Location,
            _cached: Option<&CacheEntry>,
        ) -> Result<FetchOutcome, ResourceError> {
            let mut calls = self.calls.lock().expect("lock");
            *calls += 1;
            if *calls % 2 == 1 {
                return Err(ResourceError::Transient("blip".to_string()));
            }
            let body = self.body.lock().expect("lock").clone();
            Ok(FetchOutcome::Fresh(CacheEntry {
                validator: None,
                version: git_blob_version(&body),
                body,
            }))
        }
    }

    fn reader(body: &Arc<Mutex<String>>) -> (DualPathReader, Arc<Mutex<u32>>) {
        let calls = Arc::new(Mutex::new(0));
        let strategy = Flaky {
            body: Arc::clone(body),
            calls: Arc::clone(&calls),
        };
        (
            DualPathReader::new(vec![Box::new(strategy)], ReadCache::new()),
            calls,
        )
    }

    fn location() -> Location {
        Location::new("octo", "notes", "README.md", "main")
    }

    #[test]
    fn unchanged_resource_times_out_no_earlier_than_deadline() {
        let body = Arc::new(Mutex::new("steady".to_string()));
        let (mut reader, calls) = reader(&body);
        let baseline = git_blob_version("steady");
        let poll =
            PollConfig::new(Duration::from_millis(100), Duration::from_millis(350)).expect("poll");

        let started = Instant::now();
        let outcome = await_change(&mut reader, &location(), &baseline, &poll);
        let elapsed = started.elapsed();

        assert!(matches!(outcome, WatchOutcome::Timeout { .. }));
        assert!(elapsed >= Duration::from_millis(350), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_000), "{elapsed:?}");
        let calls = *calls.lock().expect("lock");
        assert!((3..=4).contains(&calls), "calls={calls}");
    }

    #[test]
    fn change_is_reported_despite_transient_errors() {
        let body = Arc::new(Mutex::new("after".to_string()));
        let (mut reader, _) = reader(&body);
        let baseline = git_blob_version("before");
        let poll =
            PollConfig::new(Duration::from_millis(100), Duration::from_millis(2_000)).expect("poll");

        let started = Instant::now();
        let outcome = await_change(&mut reader, &location(), &baseline, &poll);

        match outcome {
            WatchOutcome::Changed(snapshot) => assert_eq!(snapshot.body, "after"),
            other => panic!("expected change, got {other:?}"),
        }
        // First read fails, second succeeds.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn known_stale_versions_do_not_count_as_change() {
        let body = Arc::new(Mutex::new("older".to_string()));
        let (mut reader, _) = reader(&body);
        let known = [git_blob_version("posted"), git_blob_version("older")];
        let poll =
            PollConfig::new(Duration::from_millis(100), Duration::from_millis(300)).expect("poll");

        let outcome = await_version_outside(&mut reader, &location(), &known, &poll);
        assert!(matches!(outcome, WatchOutcome::Timeout { .. }));
    }

    #[test]
    fn stop_flag_ends_unbounded_wait() {
        let body = Arc::new(Mutex::new("steady".to_string()));
        let (mut reader, _) = reader(&body);
        let stop = AtomicBool::new(true);
        let outcome = await_change_until_stopped(
            &mut reader,
            &location(),
            &git_blob_version("steady"),
            Duration::from_millis(100),
            &stop,
        );
        assert!(outcome.is_none());
    }
}
