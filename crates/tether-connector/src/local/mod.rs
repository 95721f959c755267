//! Client side of the local HTTP service.
//!
//! Turns relayed request envelopes into HTTP requests and their responses
//! into lazy streams of response frames.

pub mod client;
pub mod error;

pub use client::{FrameStream, LocalClientConfig, LocalService, LocalServiceClient, ResponseMode};
pub use error::LocalServiceError;
