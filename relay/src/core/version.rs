//! Content-derived versions.
//!
//! The hosted resource versions its content by git blob id. Computing the same
//! id locally lets a body fetched from the raw mirror be compared against the
//! `sha` the contents API reports, without trusting the mirror's own ETag.

use sha1::{Digest, Sha1};

use crate::core::types::Version;

/// Git blob id of `body`: `sha1("blob <len>\0<bytes>")`, lowercase hex.
pub fn git_blob_version(body: &str) -> Version {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", body.len()).as_bytes());
    hasher.update(body.as_bytes());
    Version::new(hex::encode(hasher.finalize()))
}
