//! Conditional fetch against the raw content mirror.

use std::time::Duration;

use tracing::{debug, instrument};
use ureq::Agent;

use crate::core::types::Location;
use crate::core::version::git_blob_version;
use crate::io::http::{build_agent, classify};
use crate::io::reader::{CacheEntry, FetchOutcome, FetchStrategy};
use crate::io::resource::ResourceError;

pub const DEFAULT_RAW_BASE: &str = "https://raw.githubusercontent.com";

/// Unauthenticated, quota-free reads of public resources.
///
/// The mirror's ETag is kept as the validator, but the reported version is the
/// git blob id of the body so it compares equal to the contents API `sha`.
pub struct RawMirror {
    agent: Agent,
    raw_base: String,
}

impl RawMirror {
    pub fn new(raw_base: &str, timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
            raw_base: raw_base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, location: &Location) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_base,
            location.owner,
            location.repo,
            location.branch,
            location.path.trim_start_matches('/')
        )
    }
}

impl FetchStrategy for RawMirror {
    fn name(&self) -> &'static str {
        "mirror"
    }

    #[instrument(skip_all, fields(location = %location))]
    fn fetch(
        &self,
        location: &Location,
        cached: Option<&CacheEntry>,
    ) -> Result<FetchOutcome, ResourceError> {
        let mut request = self.agent.get(&self.url(location));
        if let Some(validator) = cached.and_then(|entry| entry.validator.as_deref()) {
            request = request.set("If-None-Match", validator);
        }
        let response = request.call().map_err(|err| classify(err, location))?;
        if response.status() == 304 {
            debug!("mirror reports not modified");
            return Ok(FetchOutcome::NotModified);
        }
        let validator = response.header("etag").map(str::to_string);
        let body = response
            .into_string()
            .map_err(|err| ResourceError::Transient(format!("read mirror body: {err}")))?;
        Ok(FetchOutcome::Fresh(CacheEntry {
            validator,
            version: git_blob_version(&body),
            body,
        }))
    }
}
