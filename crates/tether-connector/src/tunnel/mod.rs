//! Cloud side of the connector.
//!
//! Provides the authenticated channel to the cloud, the router that relays
//! requests over it, and the supervisor that reconnects with backoff.

pub mod channel;
pub mod config;
pub mod error;
mod heartbeat;
pub mod inflight;
pub mod router;
pub mod supervisor;

pub use channel::{
    ChannelConnector, CloudChannel, FrameSink, InboundWork, LoopbackPeer, WsConnector,
};
pub use config::{Backoff, ChannelConfig, ReconnectPolicy};
pub use error::{ChannelError, SupervisorError};
pub use inflight::InFlightRegistry;
pub use router::{RelayRouter, RequestOutcome, RouterSummary};
pub use supervisor::{ChannelState, SessionSupervisor, SupervisorPhase, SupervisorStatus};
