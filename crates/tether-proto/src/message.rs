//! Wire messages of the relay channel.
//!
//! Every message is one JSON object tagged by its `type` field, e.g.
//! `{"type":"response.end","request_id":"r1"}`. Binary payloads travel as
//! standard base64 strings.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::envelope::{Headers, RequestEnvelope, ResponseFrame};
use crate::error::ProtoError;

/// All messages exchanged between the connector and the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CloudMessage {
    // ── Handshake ────────────────────────────────────────────────
    /// First message on every connection, sent by the connector.
    #[serde(rename = "auth")]
    Auth {
        connector_id: String,
        secret: String,
        /// Unix time in milliseconds covered by `signature`.
        timestamp: i64,
        /// Hex HMAC-SHA256 of `"{connector_id}:{timestamp}"`, see [`crate::auth`].
        signature: String,
    },

    #[serde(rename = "auth_ack")]
    AuthAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // ── Liveness ─────────────────────────────────────────────────
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,

    // ── Inbound work ─────────────────────────────────────────────
    #[serde(rename = "request")]
    Request(RequestEnvelope),

    /// Ask the connector to probe the local service.
    #[serde(rename = "health_check")]
    HealthCheck { request_id: String },

    // ── Response stream ──────────────────────────────────────────
    #[serde(rename = "response.header")]
    ResponseHeader {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: Headers,
    },

    #[serde(rename = "response.chunk")]
    ResponseChunk {
        request_id: String,
        #[serde(with = "crate::b64")]
        data: Bytes,
    },

    #[serde(rename = "response.end")]
    ResponseEnd { request_id: String },

    #[serde(rename = "response.error")]
    ResponseError { request_id: String, message: String },
}

impl CloudMessage {
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The request this message belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request(env) => Some(&env.request_id),
            Self::HealthCheck { request_id }
            | Self::ResponseHeader { request_id, .. }
            | Self::ResponseChunk { request_id, .. }
            | Self::ResponseEnd { request_id }
            | Self::ResponseError { request_id, .. } => Some(request_id),
            Self::Auth { .. } | Self::AuthAck { .. } | Self::Ping | Self::Pong => None,
        }
    }

    /// Split a response message back into its request id and frame.
    pub fn into_response_frame(self) -> Option<(String, ResponseFrame)> {
        match self {
            Self::ResponseHeader {
                request_id,
                status,
                headers,
            } => Some((request_id, ResponseFrame::Header { status, headers })),
            Self::ResponseChunk { request_id, data } => {
                Some((request_id, ResponseFrame::Chunk(data)))
            }
            Self::ResponseEnd { request_id } => Some((request_id, ResponseFrame::End)),
            Self::ResponseError {
                request_id,
                message,
            } => Some((request_id, ResponseFrame::Error(message))),
            _ => None,
        }
    }
}

/// Best-effort extraction of a `request_id` from a message that failed to decode.
///
/// Lets the receiver answer a malformed request with an error for that id
/// instead of dropping it silently.
pub fn salvage_request_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value
        .get("request_id")
        .and_then(serde_json::Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}
