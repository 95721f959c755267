//! HTTP client for the local service.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use reqwest::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
    TRANSFER_ENCODING,
};
use reqwest::{Method, Response};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

use tether_core::CredentialProvider;
use tether_core::config::LocalConfig;
use tether_proto::{Headers, RequestEnvelope, ResponseFrame};

use super::error::LocalServiceError;

/// Lazy stream of response frames for one request.
pub type FrameStream = Pin<Box<dyn Stream<Item = ResponseFrame> + Send>>;

/// Something that can answer relayed requests.
///
/// The returned stream must follow `Header? Chunk* (End | Error)`.
/// Dropping it abandons the request and releases whatever it holds.
pub trait LocalService: Send + Sync + 'static {
    fn forward(&self, envelope: RequestEnvelope) -> FrameStream;
}

/// Headers that describe a single hop and are never relayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Upper bound for `probe()`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for [`LocalServiceClient`].
#[derive(Debug, Clone)]
pub struct LocalClientConfig {
    /// Base URL of the local service, e.g. `http://127.0.0.1:18789`.
    pub base_url: String,
    /// Upper bound on the whole exchange, first byte to last chunk.
    pub request_timeout: Duration,
    /// Path used for health probes.
    pub health_path: String,
}

impl LocalClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = LocalConfig::default();
        Self {
            base_url: base_url.into(),
            request_timeout: defaults.request_timeout(),
            health_path: defaults.health_path,
        }
    }

    pub fn from_config(local: &LocalConfig) -> Self {
        Self {
            base_url: local.url.clone(),
            request_timeout: local.request_timeout(),
            health_path: local.health_path.clone(),
        }
    }
}

/// How the body of a response is relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Whole body read, then sent as one chunk.
    Buffered,
    /// Each body chunk sent as soon as it arrives.
    Streamed,
}

impl ResponseMode {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let event_stream = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim_start().starts_with("text/event-stream"));
        let chunked = headers
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        if headers.contains_key(CONTENT_LENGTH) && !event_stream && !chunked {
            Self::Buffered
        } else {
            Self::Streamed
        }
    }
}

/// Forwards relayed requests to the local service over HTTP.
///
/// The bearer token is asked for on every request, never cached.
#[derive(Clone)]
pub struct LocalServiceClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    health_path: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl LocalServiceClient {
    pub fn new(
        config: LocalClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, LocalServiceError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        // Redirects are the caller's business; the local service is never proxied.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| LocalServiceError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            health_path: config.health_path,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn build_request(
        &self,
        envelope: &RequestEnvelope,
    ) -> Result<(reqwest::RequestBuilder, String), LocalServiceError> {
        envelope
            .validate()
            .map_err(|e| LocalServiceError::InvalidRequest(e.to_string()))?;
        let method = Method::from_bytes(envelope.method.as_bytes())
            .map_err(|e| LocalServiceError::InvalidRequest(e.to_string()))?;
        let url = self.url_for(&envelope.path);

        let mut headers = HeaderMap::new();
        for (name, value) in &envelope.headers {
            if is_stripped_request_header(name) {
                continue;
            }
            let (Ok(header), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                debug!(header = %name, "Dropping unrepresentable request header");
                continue;
            };
            headers.append(header, value);
        }
        if let Some(token) = self.credentials.current_gateway_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                LocalServiceError::InvalidRequest(
                    "gateway token is not a valid header value".into(),
                )
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut request = self.http.request(method, &url).headers(headers);
        if !envelope.body.is_empty() {
            request = request.body(envelope.body.clone());
        }
        Ok((request, url))
    }

    /// `GET <health_path>` once; returns the status on success.
    pub async fn probe(&self) -> Result<u16, LocalServiceError> {
        let envelope = RequestEnvelope::new("probe", "GET", self.health_path.clone());
        let (request, url) = self.build_request(&envelope)?;
        let response = timeout(PROBE_TIMEOUT, request.send())
            .await
            .map_err(|_| LocalServiceError::Timeout(PROBE_TIMEOUT))?
            .map_err(|e| LocalServiceError::from_reqwest(&e, &url, PROBE_TIMEOUT))?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(LocalServiceError::Http(format!(
                "health probe {} returned {status}",
                self.health_path
            )))
        }
    }
}

impl LocalService for LocalServiceClient {
    fn forward(&self, envelope: RequestEnvelope) -> FrameStream {
        let client = self.clone();
        Box::pin(async_stream::stream! {
            let limit = client.request_timeout;
            let deadline = Instant::now() + limit;
            let (request, url) = match client.build_request(&envelope) {
                Ok(built) => built,
                Err(e) => {
                    yield ResponseFrame::error(e.to_string());
                    return;
                }
            };
            debug!(
                request_id = %envelope.request_id,
                method = %envelope.method,
                url = %url,
                "Sending request to local service"
            );

            let mut response = match timeout_at(deadline, request.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    yield request_failed(&e, &url, limit);
                    return;
                }
                Err(_) => {
                    yield timed_out(limit);
                    return;
                }
            };

            let mode = ResponseMode::from_headers(response.headers());
            yield response_header(&response);

            match mode {
                ResponseMode::Buffered => match timeout_at(deadline, response.bytes()).await {
                    Ok(Ok(body)) => {
                        yield ResponseFrame::Chunk(body);
                        yield ResponseFrame::End;
                    }
                    Ok(Err(e)) => {
                        yield request_failed(&e, &url, limit);
                    }
                    Err(_) => {
                        yield timed_out(limit);
                    }
                },
                ResponseMode::Streamed => loop {
                    match timeout_at(deadline, response.chunk()).await {
                        Ok(Ok(Some(chunk))) => {
                            yield ResponseFrame::Chunk(chunk);
                        }
                        Ok(Ok(None)) => {
                            yield ResponseFrame::End;
                            break;
                        }
                        Ok(Err(e)) => {
                            yield request_failed(&e, &url, limit);
                            break;
                        }
                        Err(_) => {
                            yield timed_out(limit);
                            break;
                        }
                    }
                },
            }
        })
    }
}

fn request_failed(err: &reqwest::Error, url: &str, limit: Duration) -> ResponseFrame {
    ResponseFrame::error(LocalServiceError::from_reqwest(err, url, limit).to_string())
}

fn timed_out(limit: Duration) -> ResponseFrame {
    ResponseFrame::error(LocalServiceError::Timeout(limit).to_string())
}

fn response_header(response: &Response) -> ResponseFrame {
    ResponseFrame::Header {
        status: response.status().as_u16(),
        headers: relay_headers(response.headers()),
    }
}

/// Flatten a header map for the wire, dropping hop-by-hop and non-UTF-8 values.
pub fn relay_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|joined: &mut String| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

/// Request headers the connector owns rather than the cloud caller.
fn is_stripped_request_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&name.as_str())
        || matches!(name.as_str(), "host" | "content-length" | "authorization")
}
