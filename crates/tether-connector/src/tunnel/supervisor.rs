//! Session supervisor: keeps one channel to the cloud alive across failures.
//!
//! ```text
//! Idle -> Connecting -> Running -> (Backoff -> Connecting)* -> Stopped
//! ```
//!
//! Any end of a channel other than `stop()` leads to `Backoff`. Auth
//! rejections are retried like any other failure.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::ConnectorIdentity;

use super::channel::ChannelConnector;
use super::config::{Backoff, ReconnectPolicy};
use super::error::{ChannelError, SupervisorError};
use super::router::RelayRouter;
use crate::local::LocalService;

/// Connection state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticated,
    /// The heartbeat timed out; a reconnect is forced.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Connecting,
    Running,
    Backoff,
    Stopped,
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub phase: SupervisorPhase,
    pub channel: ChannelState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Channels successfully opened so far.
    pub connections: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            phase: SupervisorPhase::Idle,
            channel: ChannelState::Disconnected,
            consecutive_failures: 0,
            last_error: None,
            connections: 0,
        }
    }
}

struct Shared<C, L> {
    identity: ConnectorIdentity,
    connector: C,
    router: RelayRouter<L>,
    policy: ReconnectPolicy,
    status: watch::Sender<SupervisorStatus>,
}

impl<C, L> Shared<C, L> {
    fn publish(&self, update: impl FnOnce(&mut SupervisorStatus)) {
        self.status.send_modify(update);
    }

    fn enter(&self, phase: SupervisorPhase, channel: ChannelState) {
        self.publish(|s| {
            s.phase = phase;
            s.channel = channel;
        });
    }
}

/// Owns the reconnect loop for one connector identity.
pub struct SessionSupervisor<C, L> {
    shared: Arc<Shared<C, L>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: Mutex<bool>,
}

impl<C: ChannelConnector, L: LocalService> SessionSupervisor<C, L> {
    pub fn new(
        identity: ConnectorIdentity,
        connector: C,
        router: RelayRouter<L>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            shared: Arc::new(Shared {
                identity,
                connector,
                router,
                policy,
                status,
            }),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
            started: Mutex::new(false),
        }
    }

    /// Spawn the reconnect loop. Fails if called twice.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if *started {
            return Err(SupervisorError::AlreadyStarted);
        }
        if self.stop.is_cancelled() {
            return Err(SupervisorError::Stopped);
        }
        *started = true;
        drop(started);

        let handle = tokio::spawn(run_loop(Arc::clone(&self.shared), self.stop.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stop the loop and wait until the channel and every request have
    /// wound down.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "Supervisor task panicked");
                }
            }
            None => self.shared.enter(SupervisorPhase::Stopped, ChannelState::Disconnected),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.shared.status.borrow().channel
    }

    pub fn status(&self) -> SupervisorStatus {
        self.shared.status.borrow().clone()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.shared.status.subscribe()
    }

    pub fn router(&self) -> &RelayRouter<L> {
        &self.shared.router
    }
}

async fn run_loop<C: ChannelConnector, L: LocalService>(
    shared: Arc<Shared<C, L>>,
    stop: CancellationToken,
) {
    let connector_id = shared.identity.connector_id.as_str();
    let mut backoff = Backoff::new(shared.policy.clone());

    while !stop.is_cancelled() {
        shared.enter(SupervisorPhase::Connecting, ChannelState::Connecting);
        info!(connector_id, attempt = backoff.failures(), "Connecting to cloud");

        let attempt = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            attempt = shared.connector.connect(&shared.identity) => attempt,
        };

        let (failure, next_state) = match attempt {
            Ok(mut channel) => {
                shared.publish(|s| {
                    s.phase = SupervisorPhase::Running;
                    s.channel = ChannelState::Authenticated;
                    s.connections += 1;
                });
                info!(
                    connector_id,
                    session_id = %channel.session_id(),
                    "Channel up, relaying requests"
                );

                let connected_at = Instant::now();
                let summary = shared.router.run(&mut channel, &stop).await;
                let uptime = connected_at.elapsed();
                let session_id = channel.session_id().to_string();
                let failure = channel.shutdown().await;
                info!(
                    connector_id,
                    session_id = %session_id,
                    dispatched = summary.dispatched,
                    completed = summary.completed,
                    failed = summary.failed,
                    rejected = summary.rejected,
                    cancelled = summary.cancelled,
                    uptime_secs = uptime.as_secs(),
                    "Channel closed"
                );
                if stop.is_cancelled() {
                    break;
                }
                if backoff.record_uptime(uptime) {
                    debug!(connector_id, "Connection was stable, backoff reset");
                }

                let failure = failure
                    .unwrap_or_else(|| ChannelError::Closed("inbound stream ended".into()));
                let next_state = if matches!(failure, ChannelError::HeartbeatTimeout(_)) {
                    ChannelState::Degraded
                } else {
                    ChannelState::Disconnected
                };
                (failure, next_state)
            }
            Err(e) => (e, ChannelState::Disconnected),
        };

        if failure.is_auth() {
            error!(connector_id, error = %failure, "Cloud rejected connector credentials");
        }

        let delay = backoff.next_delay();
        let failures = backoff.failures();
        shared.publish(|s| {
            s.phase = SupervisorPhase::Backoff;
            s.channel = next_state;
            s.consecutive_failures = failures;
            s.last_error = Some(failure.to_string());
        });
        warn!(
            connector_id,
            error = %failure,
            attempt = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );

        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = sleep(delay) => {}
        }
    }

    shared.enter(SupervisorPhase::Stopped, ChannelState::Disconnected);
    info!(connector_id, "Session supervisor stopped");
}
