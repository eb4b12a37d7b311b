//! GitHub contents API adapter.
//!
//! Implements [`VersionedResource`] on top of
//! `/repos/{owner}/{repo}/contents/{path}`: the JSON representation carries the
//! blob `sha` used as the version, and `PUT` with a `sha` field is the
//! compare-and-swap write.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};
use ureq::{Agent, Request};

use crate::core::types::{Location, Snapshot, Version};
use crate::io::http::{StatusFailure, build_agent, classify, classify_status};
use crate::io::resource::{ResourceError, VersionedResource};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const JSON_ACCEPT: &str = "application/vnd.github.v3+json";
const RAW_ACCEPT: &str = "application/vnd.github.v3.raw";

/// Authenticated client for one API base.
#[derive(Clone)]
pub struct GitHubContents {
    agent: Agent,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    truncated: bool,
}

impl ContentItem {
    /// The embedded body is incomplete or absent and must be fetched raw.
    fn needs_raw_fetch(&self) -> bool {
        self.truncated || self.encoding.as_deref() == Some("none") || self.content.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: Option<PutContent>,
}

#[derive(Debug, Deserialize)]
struct PutContent {
    sha: Option<String>,
}

/// API quota snapshot from the rate-limit headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    /// Unix timestamp (seconds) when the quota resets.
    pub reset: Option<i64>,
}

impl RateLimit {
    fn from_headers(header: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            remaining: header("x-ratelimit-remaining").and_then(|v| v.trim().parse().ok()),
            limit: header("x-ratelimit-limit").and_then(|v| v.trim().parse().ok()),
            reset: header("x-ratelimit-reset")
                .and_then(|v| v.trim().parse().ok())
                .filter(|ts| *ts > 0),
        }
    }

    /// Two-line human report: remaining over limit, then the reset time in UTC.
    pub fn render(&self) -> String {
        let count = |value: Option<u64>| value.map_or_else(|| "?".to_string(), |v| v.to_string());
        let when = self
            .reset
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map_or_else(
                || "unknown".to_string(),
                |at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            );
        format!(
            "Remaining: {} / {}\nResets at: {}",
            count(self.remaining),
            count(self.limit),
            when
        )
    }
}

impl GitHubContents {
    pub fn new(api_base: &str, token: &str, timeout: Duration) -> Self {
        Self {
            agent: build_agent(timeout),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn contents_url(&self, location: &Location) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            location.owner,
            location.repo,
            location.path.trim_start_matches('/')
        )
    }

    fn authed(&self, request: Request, accept: &str) -> Request {
        request
            .set("Authorization", &format!("token {}", self.token))
            .set("Accept", accept)
    }

    /// Query the API quota. Header data is reported even from a 403 response.
    #[instrument(skip_all)]
    pub fn rate_limit(&self) -> Result<RateLimit, ResourceError> {
        let url = format!("{}/rate_limit", self.api_base);
        let request = self.authed(self.agent.get(&url), JSON_ACCEPT);
        match request.call() {
            Ok(response) => Ok(RateLimit::from_headers(|name| {
                response.header(name).map(str::to_string)
            })),
            Err(ureq::Error::Status(status, response)) => {
                let limit =
                    RateLimit::from_headers(|name| response.header(name).map(str::to_string));
                if limit.limit.is_some() {
                    warn!(status, "rate limit endpoint answered with an error status");
                    return Ok(limit);
                }
                Err(classify_status(
                    StatusFailure::from_response(status, response),
                    &Location::new("", "", "rate_limit", ""),
                ))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(ResourceError::Transient(transport.to_string()))
            }
        }
    }

    fn get_item(&self, location: &Location) -> Result<ContentItem, ResourceError> {
        let request = self
            .authed(self.agent.get(&self.contents_url(location)), JSON_ACCEPT)
            .query("ref", &location.branch);
        let response = request.call().map_err(|err| classify(err, location))?;
        response
            .into_json::<ContentItem>()
            .map_err(|err| ResourceError::Protocol(format!("decode contents response: {err}")))
    }

    fn get_raw(&self, location: &Location) -> Result<String, ResourceError> {
        let request = self
            .authed(self.agent.get(&self.contents_url(location)), RAW_ACCEPT)
            .query("ref", &location.branch);
        let response = request.call().map_err(|err| classify(err, location))?;
        response
            .into_string()
            .map_err(|err| ResourceError::Transient(format!("read raw body: {err}")))
    }
}

/// Decode the base64 `content` field; GitHub wraps it at 60 columns.
fn decode_embedded(content: &str) -> Result<String, ResourceError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| ResourceError::Protocol(format!("decode base64 content: {err}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Pull a 40-hex blob id out of a conflict message, ignoring `expected`.
fn sha_in_message(message: &str, expected: &Version) -> Option<Version> {
    message
        .split(|c: char| !c.is_ascii_hexdigit())
        .find(|word| word.len() == 40 && *word != expected.as_str())
        .map(Version::from)
}

fn is_conflict(failure: &StatusFailure) -> bool {
    match failure.status {
        409 => true,
        422 => failure.message.to_ascii_lowercase().contains("sha"),
        _ => false,
    }
}

impl VersionedResource for GitHubContents {
    #[instrument(skip_all, fields(location = %location))]
    fn read(&self, location: &Location) -> Result<Snapshot, ResourceError> {
        let item = self.get_item(location)?;
        let body = if item.needs_raw_fetch() {
            debug!(truncated = item.truncated, "embedded content incomplete, fetching raw");
            self.get_raw(location)?
        } else {
            decode_embedded(item.content.as_deref().unwrap_or_default())?
        };
        Ok(Snapshot {
            version: Version::new(item.sha),
            body,
        })
    }

    #[instrument(skip_all, fields(location = %location, expected = %expected))]
    fn write(
        &self,
        location: &Location,
        body: &str,
        expected: &Version,
        message: &str,
    ) -> Result<Version, ResourceError> {
        let payload = json!({
            "message": message,
            "content": BASE64.encode(body.as_bytes()),
            "sha": expected.as_str(),
            "branch": location.branch,
        });
        let request = self.authed(self.agent.put(&self.contents_url(location)), JSON_ACCEPT);
        let response = match request.send_json(payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let failure = StatusFailure::from_response(status, response);
                if is_conflict(&failure) {
                    return Err(ResourceError::VersionConflict {
                        expected: expected.clone(),
                        current: sha_in_message(&failure.message, expected),
                    });
                }
                return Err(classify_status(failure, location));
            }
            Err(err) => return Err(classify(err, location)),
        };

        let posted = response
            .into_json::<PutResponse>()
            .ok()
            .and_then(|put| put.content)
            .and_then(|content| content.sha);
        match posted {
            Some(sha) => Ok(Version::new(sha)),
            None => {
                debug!("write response carried no sha, re-reading version");
                self.read(location).map(|snapshot| snapshot.version)
            }
        }
    }

    fn read_full(&self, location: &Location) -> Result<String, ResourceError> {
        self.get_raw(location)
    }
}
