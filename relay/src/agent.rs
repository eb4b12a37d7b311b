//! The exclusive agent loop behind `relay agent`.
//!
//! One agent per resource per host: [`start_agent`] takes the named lock first
//! and returns [`AgentExit::AlreadyRunning`] without touching the resource when
//! another agent holds it. Inside the lock, [`run_agent`] watches for new
//! versions, runs the directive on the last line, and commits the framed result
//! with a compare-and-swap write.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::framing::{compose_result, extract_directive};
use crate::core::lock_name::lock_name;
use crate::core::types::{Location, MIN_INTERVAL_MS, Version};
use crate::io::config::RelayConfig;
use crate::io::executor::{ExecRequest, Executor, execute_capturing};
use crate::io::lock::LockProvider;
use crate::io::reader::DualPathReader;
use crate::io::resource::{ResourceError, VersionedResource};
use crate::io::watcher::await_change_until_stopped;

/// Commit message for result writes.
pub const AGENT_COMMIT_MESSAGE: &str = "relay: command output";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub location: Location,
    pub interval: Duration,
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    /// Directives run here; the agent's own working directory when `None`.
    pub workdir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_relay_config(cfg: &RelayConfig, workdir: Option<PathBuf>) -> Result<Self> {
        if cfg.interval_ms < MIN_INTERVAL_MS {
            return Err(anyhow!(
                "interval_ms must be >= {MIN_INTERVAL_MS} (got {})",
                cfg.interval_ms
            ));
        }
        Ok(Self {
            location: cfg.location(),
            interval: Duration::from_millis(cfg.interval_ms),
            command_timeout: Duration::from_secs(cfg.agent.command_timeout_secs),
            output_limit_bytes: cfg.agent.output_limit_bytes,
            workdir,
        })
    }
}

/// How the result write of a round ended. Each variant carries the version the
/// agent adopted as `last_seen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The first write landed.
    Committed { version: Version },
    /// The first write lost a race; the single retry landed.
    Retried { version: Version },
    /// Both writes lost. The result was dropped and the agent resynced.
    Abandoned { version: Version },
    /// The winning writer replaced the directive this round ran. The result was
    /// dropped and `version` is the round's own, so the new directive runs next.
    Superseded { version: Version },
    /// The write failed for a non-conflict reason and the agent resynced.
    Failed { version: Version, error: String },
}

impl CommitOutcome {
    pub fn version(&self) -> &Version {
        match self {
            CommitOutcome::Committed { version }
            | CommitOutcome::Retried { version }
            | CommitOutcome::Abandoned { version }
            | CommitOutcome::Superseded { version }
            | CommitOutcome::Failed { version, .. } => version,
        }
    }

    pub fn landed(&self) -> bool {
        matches!(
            self,
            CommitOutcome::Committed { .. } | CommitOutcome::Retried { .. }
        )
    }
}

/// One executed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    /// 1-based count of directives executed by this agent.
    pub round: u32,
    pub directive: String,
    pub commit: CommitOutcome,
}

/// Progress reported to the caller of [`run_agent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// About to wait for a version other than `last_seen`.
    Polling { last_seen: Version },
    /// A new version had nothing to run on its last line.
    Skipped { version: Version },
    Round(RoundOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// Another agent holds the lock for this resource.
    AlreadyRunning,
    /// The stop flag was raised.
    Stopped { rounds: u32 },
}

/// Take the per-resource lock and run the agent loop while holding it.
///
/// The guard lives until this function returns, whichever way it returns.
#[instrument(skip_all, fields(location = %config.location))]
pub fn start_agent<L, R, E, F>(
    locks: &L,
    resource: &R,
    reader: &mut DualPathReader,
    executor: &E,
    config: &AgentConfig,
    stop: &AtomicBool,
    on_event: F,
) -> Result<AgentExit>
where
    L: LockProvider,
    R: VersionedResource,
    E: Executor,
    F: FnMut(&AgentEvent),
{
    let name = lock_name(&config.location);
    let Some(_guard) = locks
        .try_acquire(&name)
        .with_context(|| format!("acquire agent lock {name}"))?
    else {
        debug!(lock = %name, "another agent is running for this resource");
        return Ok(AgentExit::AlreadyRunning);
    };
    info!(lock = %name, "agent lock acquired");
    run_agent(resource, reader, executor, config, stop, on_event)
}

/// Watch the resource and execute each new directive exactly once.
///
/// `last_seen` starts at the version current at startup, so a directive that
/// was already there is not run. Read and write failures inside the loop are
/// logged and the loop carries on; only a rejected or missing resource at
/// startup is fatal.
pub fn run_agent<R, E, F>(
    resource: &R,
    reader: &mut DualPathReader,
    executor: &E,
    config: &AgentConfig,
    stop: &AtomicBool,
    mut on_event: F,
) -> Result<AgentExit>
where
    R: VersionedResource,
    E: Executor,
    F: FnMut(&AgentEvent),
{
    let Some(mut last_seen) = read_baseline(resource, config, stop)? else {
        return Ok(AgentExit::Stopped { rounds: 0 });
    };
    info!(version = %last_seen, "agent started");

    let mut rounds = 0u32;
    loop {
        on_event(&AgentEvent::Polling {
            last_seen: last_seen.clone(),
        });
        let Some(observed) =
            await_change_until_stopped(reader, &config.location, &last_seen, config.interval, stop)
        else {
            info!(rounds, "stop requested");
            return Ok(AgentExit::Stopped { rounds });
        };

        // The fast path may lag; act only on what the authoritative read says.
        let snapshot = match resource.read(&config.location) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "confirming read failed, will retry");
                continue;
            }
        };
        if snapshot.version == last_seen {
            debug!(observed = %observed.version, "change not confirmed");
            continue;
        }

        let (history, directive) = extract_directive(&snapshot.body);
        if directive.trim().is_empty() {
            debug!(version = %snapshot.version, "no directive on last line");
            on_event(&AgentEvent::Skipped {
                version: snapshot.version.clone(),
            });
            last_seen = snapshot.version;
            continue;
        }

        rounds += 1;
        let request = ExecRequest {
            directive: directive.to_string(),
            workdir: config.workdir.clone(),
            timeout: config.command_timeout,
            output_limit_bytes: config.output_limit_bytes,
        };
        let output = execute_capturing(executor, &request);
        let round = PendingResult {
            history,
            directive,
            output: &output,
        };
        let commit = commit_result(resource, &config.location, &round, &snapshot.version);
        last_seen = commit.version().clone();

        info!(round = rounds, landed = commit.landed(), version = %last_seen, "round finished");
        on_event(&AgentEvent::Round(RoundOutcome {
            round: rounds,
            directive: request.directive,
            commit,
        }));
    }
}

/// Initial `last_seen`. Transient failures are retried every interval.
fn read_baseline<R: VersionedResource>(
    resource: &R,
    config: &AgentConfig,
    stop: &AtomicBool,
) -> Result<Option<Version>> {
    loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(None);
        }
        match resource.read(&config.location) {
            Ok(snapshot) => return Ok(Some(snapshot.version)),
            Err(err @ (ResourceError::Auth { .. } | ResourceError::NotFound { .. })) => {
                return Err(err).with_context(|| format!("read {}", config.location));
            }
            Err(err) => {
                warn!(%err, "initial read failed, retrying");
                thread::sleep(config.interval);
            }
        }
    }
}

/// Output of one round, not yet framed.
struct PendingResult<'a> {
    history: &'a str,
    directive: &'a str,
    output: &'a str,
}

/// Write the framed result against `round_version`. After a conflict the body
/// is rebuilt on top of the winning version and written once more, unless the
/// winner dropped the round's history or posted a different directive.
fn commit_result<R: VersionedResource>(
    resource: &R,
    location: &Location,
    round: &PendingResult<'_>,
    round_version: &Version,
) -> CommitOutcome {
    let body = compose_result(round.history, round.directive, round.output);
    match resource.write(location, &body, round_version, AGENT_COMMIT_MESSAGE) {
        Ok(version) => return CommitOutcome::Committed { version },
        Err(err) if err.is_conflict() => {
            warn!(%err, "result write lost a race, retrying once");
        }
        Err(err) => {
            warn!(%err, "result write failed");
            return CommitOutcome::Failed {
                version: resync(resource, location, round_version),
                error: err.to_string(),
            };
        }
    }

    let fresh = match resource.read(location) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(%err, "re-read before retry failed");
            return CommitOutcome::Failed {
                version: round_version.clone(),
                error: err.to_string(),
            };
        }
    };
    let (fresh_history, fresh_directive) = extract_directive(&fresh.body);
    if fresh_directive != round.directive || !fresh_history.starts_with(round.history) {
        info!(version = %fresh.version, "directive replaced while running, dropping result");
        return CommitOutcome::Superseded {
            version: round_version.clone(),
        };
    }

    let body = compose_result(fresh_history, round.directive, round.output);
    match resource.write(location, &body, &fresh.version, AGENT_COMMIT_MESSAGE) {
        Ok(version) => CommitOutcome::Retried { version },
        Err(err) if err.is_conflict() => {
            warn!(%err, "retry lost a race too, dropping result");
            CommitOutcome::Abandoned {
                version: resync(resource, location, &fresh.version),
            }
        }
        Err(err) => {
            warn!(%err, "retry write failed");
            CommitOutcome::Failed {
                version: resync(resource, location, &fresh.version),
                error: err.to_string(),
            }
        }
    }
}

/// Current version, or `fallback` when it cannot be read.
fn resync<R: VersionedResource>(resource: &R, location: &Location, fallback: &Version) -> Version {
    match resource.read(location) {
        Ok(snapshot) => snapshot.version,
        Err(err) => {
            warn!(%err, "resync read failed");
            fallback.clone()
        }
    }
}
