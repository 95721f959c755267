//! Heartbeat task for channel liveness.
//!
//! Sends a `ping` every interval and watches for `pong`s. Only a `pong`
//! counts as proof of life; other inbound traffic does not.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use tether_proto::CloudMessage;

use super::channel::{ChannelShared, FrameSink};
use super::error::ChannelError;

/// Time of the last `pong` seen on a channel.
pub(crate) struct Liveness {
    last_pong: Mutex<Instant>,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            last_pong: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn record_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn last_pong(&self) -> Instant {
        *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawn the heartbeat for one channel. The task ends when the channel
/// closes, or closes the channel itself after `timeout` without a `pong`.
pub(crate) fn spawn_heartbeat(
    sink: FrameSink,
    liveness: Arc<Liveness>,
    interval: Duration,
    timeout: Duration,
    shared: Arc<ChannelShared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            let deadline = liveness.last_pong() + timeout;
            tokio::select! {
                biased;
                () = shared.closed.cancelled() => {
                    debug!("Heartbeat task shutting down");
                    return;
                }
                () = tokio::time::sleep_until(deadline) => {
                    let silent_for = liveness.last_pong().elapsed();
                    if silent_for >= timeout {
                        warn!(
                            silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                            "No pong from cloud, channel degraded"
                        );
                        shared.fail(ChannelError::HeartbeatTimeout(silent_for));
                        return;
                    }
                }
                _ = timer.tick() => {
                    // A full outbound queue must not hold the deadline off.
                    tokio::select! {
                        biased;
                        () = shared.closed.cancelled() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                        sent = sink.send(CloudMessage::Ping) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    })
}
