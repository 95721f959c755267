//! Protocol error types.

/// Errors raised while decoding or validating relay messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The message is not valid JSON or does not match any known kind.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The message decoded but breaks a protocol rule (bad path, empty id, ...).
    #[error("Protocol violation: {0}")]
    Violation(String),

    #[error("Signature error: {0}")]
    Signature(String),
}
