//! Per-request data model: inbound request envelopes and outbound response frames.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;
use crate::message::CloudMessage;

/// HTTP headers as carried on the wire. Repeated headers are joined with `", "`.
pub type Headers = BTreeMap<String, String>;

/// A unit of work received from the cloud.
///
/// `request_id` is the correlation key for every response frame sent back
/// for this request; it must be unique among in-flight requests on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "crate::b64")]
    pub body: Bytes,
}

impl RequestEnvelope {
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Check the envelope can be turned into a local HTTP request.
    ///
    /// The path must be origin-relative so a request can never be pointed
    /// at a host other than the configured local service.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.request_id.is_empty() {
            return Err(ProtoError::Violation("request_id is empty".into()));
        }
        if self.method.is_empty() || !self.method.bytes().all(is_token_char) {
            return Err(ProtoError::Violation(format!(
                "invalid HTTP method {:?}",
                self.method
            )));
        }
        if !self.path.starts_with('/') || self.path.starts_with("//") {
            return Err(ProtoError::Violation(format!(
                "path must be origin-relative, got {:?}",
                self.path
            )));
        }
        Ok(())
    }
}

/// RFC 9110 `tchar`.
const fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
    ) || b.is_ascii_alphanumeric()
}

/// One element of a response stream for a single request.
///
/// A well-formed stream is `Header? Chunk* (End | Error)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    Header { status: u16, headers: Headers },
    Chunk(Bytes),
    End,
    Error(String),
}

impl ResponseFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Whether this frame closes the response stream.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error(_))
    }

    /// Tag the frame with its request and turn it into a wire message.
    pub fn into_message(self, request_id: String) -> CloudMessage {
        match self {
            Self::Header { status, headers } => CloudMessage::ResponseHeader {
                request_id,
                status,
                headers,
            },
            Self::Chunk(data) => CloudMessage::ResponseChunk { request_id, data },
            Self::End => CloudMessage::ResponseEnd { request_id },
            Self::Error(message) => CloudMessage::ResponseError {
                request_id,
                message,
            },
        }
    }
}

/// Check a frame sequence against the `Header? Chunk* (End | Error)` grammar.
pub fn is_well_formed(frames: &[ResponseFrame]) -> bool {
    let Some((last, body)) = frames.split_last() else {
        return false;
    };
    if !last.is_terminal() {
        return false;
    }
    let chunks = match body.first() {
        Some(ResponseFrame::Header { .. }) => &body[1..],
        _ => body,
    };
    chunks
        .iter()
        .all(|frame| matches!(frame, ResponseFrame::Chunk(_)))
}
