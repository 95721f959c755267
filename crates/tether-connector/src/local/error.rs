//! Local service error types.

use std::time::Duration;

/// Why a request to the local service failed.
///
/// These never escape the client: each one is rendered into the single
/// `Error` frame that terminates the request's response stream.
#[derive(Debug, thiserror::Error)]
pub enum LocalServiceError {
    #[error("connection to local service at {url} failed: {detail}")]
    Connect { url: String, detail: String },

    #[error("local service did not respond within {0:?}")]
    Timeout(Duration),

    #[error("local service request failed: {0}")]
    Http(String),

    #[error("invalid request for local service: {0}")]
    InvalidRequest(String),
}

impl LocalServiceError {
    /// Classify a `reqwest` failure for a request to `url`.
    pub fn from_reqwest(err: &reqwest::Error, url: &str, timeout: Duration) -> Self {
        if err.is_connect() {
            Self::Connect {
                url: url.to_string(),
                detail: error_chain(err),
            }
        } else if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Http(format!("{err}: {}", error_chain(err)))
        }
    }
}

/// Walk the `source()` chain of an error and join into a single string.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}
