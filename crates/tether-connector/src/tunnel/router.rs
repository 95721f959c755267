//! Relay router: dispatches inbound cloud work to the local service and
//! streams the responses back.
//!
//! Each request runs in its own task so a slow local call never blocks the
//! channel; only the framing onto the outbound queue is serialized.

use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_proto::{RequestEnvelope, ResponseFrame};

use super::channel::{CloudChannel, FrameSink, InboundWork};
use super::inflight::{InFlightRegistry, Ticket};
use crate::local::LocalService;

/// How a relayed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// An `End` frame was sent.
    Completed,
    /// An `Error` frame was sent.
    Failed,
    /// The request was abandoned before its terminal frame.
    Cancelled,
}

/// Counters for one `run()`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterSummary {
    pub dispatched: usize,
    pub rejected: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Request tasks that panicked. Not included in the other counters.
    pub panicked: usize,
}

impl RouterSummary {
    fn record(&mut self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Completed => self.completed += 1,
            RequestOutcome::Failed => self.failed += 1,
            RequestOutcome::Cancelled => self.cancelled += 1,
        }
    }

    fn record_joined(&mut self, joined: Result<RequestOutcome, JoinError>) {
        match joined {
            Ok(outcome) => self.record(outcome),
            Err(e) if e.is_panic() => {
                error!(error = %e, "Request task panicked");
                self.panicked += 1;
            }
            Err(_) => self.record(RequestOutcome::Cancelled),
        }
    }
}

/// Routes requests from one channel at a time to a [`LocalService`].
pub struct RelayRouter<L> {
    local: Arc<L>,
    in_flight: InFlightRegistry,
    health_path: String,
}

impl<L: LocalService> RelayRouter<L> {
    pub fn new(local: Arc<L>, health_path: impl Into<String>) -> Self {
        Self {
            local,
            in_flight: InFlightRegistry::new(),
            health_path: health_path.into(),
        }
    }

    pub const fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Serve `channel` until it closes or `shutdown` is cancelled.
    ///
    /// Every request still in flight when the loop ends is cancelled, and
    /// this only returns once all request tasks have finished.
    pub async fn run(
        &self,
        channel: &mut CloudChannel,
        shutdown: &CancellationToken,
    ) -> RouterSummary {
        let sink = channel.sink();
        let closed = channel.closed_token();
        let mut tasks: JoinSet<RequestOutcome> = JoinSet::new();
        let mut summary = RouterSummary::default();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    debug!(session_id = %channel.session_id(), "Router stopping on shutdown");
                    break;
                }
                () = closed.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    summary.record_joined(joined);
                }
                work = channel.next_work() => match work {
                    Some(work) => self.dispatch(work, &sink, &mut tasks, &mut summary).await,
                    None => break,
                },
            }
        }

        let cancelled = self.in_flight.cancel_all();
        if cancelled > 0 {
            info!(
                session_id = %channel.session_id(),
                cancelled,
                "Cancelled in-flight requests"
            );
        }
        while let Some(joined) = tasks.join_next().await {
            summary.record_joined(joined);
        }
        summary
    }

    async fn dispatch(
        &self,
        work: InboundWork,
        sink: &FrameSink,
        tasks: &mut JoinSet<RequestOutcome>,
        summary: &mut RouterSummary,
    ) {
        let envelope = match work {
            InboundWork::Request(envelope) => envelope,
            InboundWork::HealthCheck { request_id } => {
                RequestEnvelope::new(request_id, "GET", self.health_path.clone())
            }
            InboundWork::Malformed { request_id, reason } => {
                summary.rejected += 1;
                reject(sink, &request_id, format!("malformed request: {reason}")).await;
                return;
            }
        };

        if let Err(e) = envelope.validate() {
            summary.rejected += 1;
            if envelope.request_id.is_empty() {
                warn!(error = %e, "Dropping request without request_id");
            } else {
                reject(sink, &envelope.request_id, e.to_string()).await;
            }
            return;
        }

        let Some(ticket) = self.in_flight.register(&envelope.request_id) else {
            summary.rejected += 1;
            reject(
                sink,
                &envelope.request_id,
                "duplicate request_id: a request with this id is already in flight".into(),
            )
            .await;
            return;
        };

        summary.dispatched += 1;
        tasks.spawn(relay_request(
            Arc::clone(&self.local),
            envelope,
            ticket,
            self.in_flight.clone(),
            sink.clone(),
        ));
    }
}

async fn reject(sink: &FrameSink, request_id: &str, reason: String) {
    warn!(request_id, reason = %reason, "Rejecting request");
    if sink
        .send_frame(request_id, ResponseFrame::Error(reason))
        .await
        .is_err()
    {
        debug!(request_id, "Channel closed before rejection was sent");
    }
}

/// Relay one request, frame by frame, until its terminal frame is sent or
/// its ticket is cancelled.
async fn relay_request<L: LocalService>(
    local: Arc<L>,
    envelope: RequestEnvelope,
    ticket: Ticket,
    registry: InFlightRegistry,
    sink: FrameSink,
) -> RequestOutcome {
    let request_id = envelope.request_id.clone();
    debug!(
        request_id = %request_id,
        method = %envelope.method,
        path = %envelope.path,
        "Relaying request"
    );

    let mut frames = local.forward(envelope);
    let outcome = loop {
        let next = tokio::select! {
            biased;
            () = ticket.cancel.cancelled() => break None,
            next = frames.next() => next,
        };
        let frame = next.unwrap_or_else(|| {
            ResponseFrame::error("local service stream ended without a terminal frame")
        });
        let terminal = match &frame {
            ResponseFrame::End => Some(RequestOutcome::Completed),
            ResponseFrame::Error(message) => {
                warn!(request_id = %request_id, error = %message, "Request failed");
                Some(RequestOutcome::Failed)
            }
            _ => None,
        };
        let sent = tokio::select! {
            biased;
            () = ticket.cancel.cancelled() => false,
            sent = sink.send_frame(&request_id, frame) => sent.is_ok(),
        };
        if !sent {
            break None;
        }
        if terminal.is_some() {
            break terminal;
        }
    };
    // Release the local connection before the entry disappears.
    drop(frames);

    let elapsed = registry.finish(&request_id, ticket.seq);
    match outcome {
        Some(outcome) => {
            debug!(
                request_id = %request_id,
                ?outcome,
                elapsed_ms = elapsed.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                "Request finished"
            );
            outcome
        }
        None => {
            debug!(request_id = %request_id, "Request cancelled");
            RequestOutcome::Cancelled
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::too_many_lines
)]
#[path = "router_tests.rs"]
mod tests;
