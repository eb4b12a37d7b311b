//! Pure relay logic: value types, framing, versions and lock naming.
//!
//! Nothing in here performs I/O, so every rule of the wire format can be
//! tested without a network or a filesystem.

pub mod framing;
pub mod lock_name;
pub mod types;
pub mod version;
