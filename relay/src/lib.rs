//! Remote command relay over a versioned file in a GitHub repository.
//!
//! A controller appends a one-line directive to the file; an agent notices the
//! new version, runs the directive, and writes the output back above the same
//! directive. Every write is a compare-and-swap against the version the writer
//! last read, so concurrent writers never silently overwrite each other.
//!
//! - **[`core`]**: Pure logic (framing, versions, lock names, poll settings).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: The hosted resource, the dual-path reader, polling, locks,
//!   processes and configuration.
//!
//! Orchestration modules ([`agent`], [`controller`], [`script`]) combine the two
//! to implement the CLI commands.

pub mod agent;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod script;
pub mod signals;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
