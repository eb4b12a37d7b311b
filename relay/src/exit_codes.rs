//! Stable exit codes for relay CLI commands.

/// Command succeeded. Also used by `relay agent` when another agent already
/// holds the lock.
pub const OK: i32 = 0;
/// Invalid config, arguments, credentials or any other error.
pub const INVALID: i32 = 1;
/// `relay send` posted the directive but nothing answered before the deadline.
pub const NO_CHANGE: i32 = 2;
/// `relay send` lost the compare-and-swap to another writer.
pub const CONFLICT: i32 = 3;
