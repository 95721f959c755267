//! Tether relay protocol
//!
//! Message types exchanged between a connector and the cloud control plane.
//!
//! This crate contains:
//! - `CloudMessage`, the JSON wire vocabulary of the relay channel
//! - `RequestEnvelope` / `ResponseFrame`, the per-request data model
//! - HMAC signing for the connector handshake

pub mod auth;
mod b64;
pub mod envelope;
pub mod error;
pub mod message;

pub use envelope::{Headers, RequestEnvelope, ResponseFrame, is_well_formed};
pub use error::ProtoError;
pub use message::CloudMessage;
