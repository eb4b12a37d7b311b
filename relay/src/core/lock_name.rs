//! Deterministic agent lock names.

use sha2::{Digest, Sha256};

use crate::core::types::Location;

/// Name of the agent lock for `location`.
///
/// Derived from owner, repo and path only: two agents on different branches of
/// the same file still contend, since they would race on the same directive log.
pub fn lock_name(location: &Location) -> String {
    let mut hasher = Sha256::new();
    for part in [&location.owner, &location.repo, &location.path] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("relay-{}.lock", &digest[..16])
}
