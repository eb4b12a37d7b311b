//! Shared HTTP plumbing for the remote adapters.

use std::time::Duration;

use serde::Deserialize;
use ureq::{Agent, AgentBuilder, Response};

use crate::core::types::Location;
use crate::io::resource::ResourceError;

pub const USER_AGENT: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout used when the caller does not pick one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a blocking HTTP agent with the relay user agent and a request timeout.
pub fn build_agent(timeout: Duration) -> Agent {
    AgentBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// A non-2xx response reduced to the parts the classifiers look at.
#[derive(Debug)]
pub struct StatusFailure {
    pub status: u16,
    pub message: String,
    pub rate_limit_remaining: Option<String>,
}

impl StatusFailure {
    pub fn from_response(status: u16, response: Response) -> Self {
        let rate_limit_remaining = response
            .header("x-ratelimit-remaining")
            .map(str::to_string);
        let raw = response.into_string().unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&raw)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or(raw);
        Self {
            status,
            message: message.trim().to_string(),
            rate_limit_remaining,
        }
    }

    fn rate_limited(&self) -> bool {
        self.status == 429 || self.rate_limit_remaining.as_deref() == Some("0")
    }
}

/// Map a transport or status failure onto the resource error taxonomy.
pub fn classify(err: ureq::Error, location: &Location) -> ResourceError {
    match err {
        ureq::Error::Status(status, response) => {
            classify_status(StatusFailure::from_response(status, response), location)
        }
        ureq::Error::Transport(transport) => ResourceError::Transient(transport.to_string()),
    }
}

pub fn classify_status(failure: StatusFailure, location: &Location) -> ResourceError {
    if failure.rate_limited() {
        return ResourceError::Transient(format!(
            "rate limited (status {}): {}",
            failure.status, failure.message
        ));
    }
    match failure.status {
        401 | 403 => ResourceError::Auth {
            status: failure.status,
            message: failure.message,
        },
        404 => ResourceError::NotFound {
            location: location.to_string(),
        },
        500..=599 => ResourceError::Transient(format!(
            "server error {}: {}",
            failure.status, failure.message
        )),
        status => ResourceError::Protocol(format!("status {status}: {}", failure.message)),
    }
}
