//! Enrolled connector identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The `(connector_id, secret)` pair produced by enrollment.
///
/// Immutable once enrolled. The secret never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorIdentity {
    pub connector_id: String,
    pub secret: String,
}

impl ConnectorIdentity {
    pub fn new(connector_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            connector_id: connector_id.into(),
            secret: secret.into(),
        }
    }

    /// Both halves are present.
    pub fn is_complete(&self) -> bool {
        !self.connector_id.is_empty() && !self.secret.is_empty()
    }
}

impl fmt::Debug for ConnectorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorIdentity")
            .field("connector_id", &self.connector_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}
