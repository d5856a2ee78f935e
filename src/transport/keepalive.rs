//! Keep-alive monitor
//!
//! Probes a session on a fixed interval. A failed probe is reported as
//! `Degraded`, a success after failures as `Healthy`. `failure_threshold`
//! consecutive failures, or the connection closing underneath, end the
//! monitor with a single `Dead` event.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProbeOutcome, SessionHandle};
use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
}

impl KeepaliveConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.keepalive_interval(),
            probe_timeout: settings.keepalive_timeout(),
            failure_threshold: settings.keepalive_failure_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Healthy,
    Degraded { missed: u32 },
    Dead { reason: String },
}

pub fn spawn_keepalive(
    session: SessionHandle,
    config: KeepaliveConfig,
    cancel: CancellationToken,
    events: mpsc::Sender<HealthEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                _ = session.closed() => {
                    debug!("Keep-alive: connection closed");
                    let dead = HealthEvent::Dead { reason: "connection closed".into() };
                    report(&events, &cancel, dead).await;
                    return;
                }

                _ = ticker.tick() => {
                    let outcome = tokio::time::timeout(config.probe_timeout, session.health_check())
                        .await
                        .unwrap_or(ProbeOutcome::Degraded);

                    let event = match outcome {
                        ProbeOutcome::Healthy if missed == 0 => continue,
                        ProbeOutcome::Healthy => {
                            debug!("Keep-alive recovered after {} missed probe(s)", missed);
                            missed = 0;
                            HealthEvent::Healthy
                        }
                        ProbeOutcome::Degraded => {
                            missed += 1;
                            warn!("Keep-alive probe failed ({}/{})", missed, config.failure_threshold);
                            if missed >= config.failure_threshold {
                                HealthEvent::Dead {
                                    reason: format!("{} consecutive keep-alive probes failed", missed),
                                }
                            } else {
                                HealthEvent::Degraded { missed }
                            }
                        }
                        ProbeOutcome::Closed => HealthEvent::Dead {
                            reason: "connection closed".into(),
                        },
                    };

                    let dead = matches!(event, HealthEvent::Dead { .. });
                    if !report(&events, &cancel, event).await || dead {
                        return;
                    }
                }
            }
        }
    })
}

/// Deliver one event unless cancelled first. False when the monitor should end.
async fn report(
    events: &mpsc::Sender<HealthEvent>,
    cancel: &CancellationToken,
    event: HealthEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}
