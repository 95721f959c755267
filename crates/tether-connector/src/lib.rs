//! Tether Connector Library
//!
//! The relay session engine of the connector:
//! - Local service client for forwarding requests over HTTP
//! - Authenticated WebSocket channel to the cloud with heartbeat
//! - Request router with per-request cancellation
//! - Session supervisor with reconnect backoff

pub mod local;
pub mod tunnel;
