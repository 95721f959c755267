//! Handshake signing.
//!
//! The connector proves possession of its enrollment secret by signing
//! `"{connector_id}:{timestamp}"` with HMAC-SHA256. Secrets issued at
//! enrollment are hex strings and are used as raw key bytes; anything that
//! is not valid hex is used verbatim.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ProtoError;
use crate::message::CloudMessage;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str, connector_id: &str, timestamp_ms: i64) -> Result<HmacSha256, ProtoError> {
    let key = hex::decode(secret).unwrap_or_else(|_| secret.as_bytes().to_vec());
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| ProtoError::Signature(e.to_string()))?;
    mac.update(format!("{connector_id}:{timestamp_ms}").as_bytes());
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 signature for the handshake.
pub fn sign(secret: &str, connector_id: &str, timestamp_ms: i64) -> Result<String, ProtoError> {
    let mac = mac_for(secret, connector_id, timestamp_ms)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a handshake signature.
pub fn verify(secret: &str, connector_id: &str, timestamp_ms: i64, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    mac_for(secret, connector_id, timestamp_ms)
        .map(|mac| mac.verify_slice(&expected).is_ok())
        .unwrap_or(false)
}

/// Build the `auth` message that opens every connection.
pub fn auth_message(
    connector_id: &str,
    secret: &str,
    timestamp_ms: i64,
) -> Result<CloudMessage, ProtoError> {
    Ok(CloudMessage::Auth {
        connector_id: connector_id.to_string(),
        secret: secret.to_string(),
        timestamp: timestamp_ms,
        signature: sign(secret, connector_id, timestamp_ms)?,
    })
}
