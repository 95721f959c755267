//! Cloud channel and supervisor error types.

use std::time::Duration;

/// Why a cloud channel could not be opened, or why it ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The cloud rejected the connector's credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport-level failure: DNS, TCP, TLS, WebSocket, read or write.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Heartbeat timeout: no pong for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The channel ended without a transport error.
    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Errors returned by the session supervisor's control surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor already started")]
    AlreadyStarted,

    #[error("Supervisor has been stopped")]
    Stopped,
}
