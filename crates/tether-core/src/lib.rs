//! `Tether` Core Library
//!
//! Shared functionality for the Tether connector:
//! - Connector configuration model and hierarchical loading
//! - Enrolled connector identity
//! - Rotation-tolerant credential lookup for the local service
//! - Common error types and tracing setup

pub mod config;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod tracing_init;

pub use config::ConnectorConfig;
pub use credentials::{CredentialProvider, FileCredentialProvider, StaticToken};
pub use error::{Error, Result};
pub use identity::ConnectorIdentity;
