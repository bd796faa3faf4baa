//! DriftMonitor — periodic position polling while something is playing.
//!
//! The monitor only measures. Each report is compared against the timeline
//! anchored by the last play command, with the reporter's one-way latency
//! subtracted, and the result is kept on the client record for diagnostics.
//! Correcting drift is left to whoever consumes [`DriftMonitor::latest_positions`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::identity::ClientId;
use crate::domain::messages::ServerMsg;
use crate::domain::playback::SyncState;

use super::broadcast::{self, BroadcastReport};
use super::ports::Clock;
use super::registry::{ClientRegistry, PositionSample};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    pub client_id: ClientId,
    pub sample: PositionSample,
}

pub struct DriftMonitor {
    registry: Arc<ClientRegistry>,
    state: Arc<RwLock<SyncState>>,
    clock: Arc<dyn Clock>,
    warn_threshold_ms: f64,
}

impl DriftMonitor {
    pub fn new(
        registry: Arc<ClientRegistry>,
        state: Arc<RwLock<SyncState>>,
        clock: Arc<dyn Clock>,
        warn_threshold_ms: f64,
    ) -> Self {
        Self {
            registry,
            state,
            clock,
            warn_threshold_ms,
        }
    }

    /// Ask every player for its position. No-op unless playing.
    pub async fn tick(&self) -> Option<BroadcastReport> {
        if !self.state.read().await.is_playing() {
            return None;
        }
        let players = self.registry.player_recipients().await;
        Some(broadcast::broadcast(&players, &ServerMsg::SyncCheckPosition).await)
    }

    /// Absorb a `sync_report_position`. Unknown clients are ignored.
    pub async fn handle_position_report(
        &self,
        id: &ClientId,
        current_time: f64,
    ) -> Option<PositionSample> {
        let now = self.clock.now_ms();
        let latency_ms = self.registry.mean_latency_of(id).await.unwrap_or(0.0);
        let timeline = {
            let state = self.state.read().await;
            state.is_playing().then(|| state.timeline()).flatten()
        };
        // The report left the client one latency ago.
        let drift_ms = timeline.map(|t| {
            let sent_at = now - latency_ms.round() as i64;
            (current_time - t.position_at(sent_at)) * 1000.0
        });

        let sample = PositionSample {
            position_seconds: current_time,
            received_at_ms: now,
            drift_ms,
        };
        if !self.registry.record_position(id, sample).await {
            debug!(client_id = %id, "Position report from unknown client ignored");
            return None;
        }

        match drift_ms {
            Some(d) if d.abs() > self.warn_threshold_ms => {
                warn!(client_id = %id, drift_ms = d, position = current_time, "Client drifting")
            }
            Some(d) => debug!(client_id = %id, drift_ms = d, "Position report"),
            None => debug!(client_id = %id, position = current_time, "Position report while idle"),
        }
        Some(sample)
    }

    /// Latest position per player, for diagnostics and alerting.
    pub async fn latest_positions(&self) -> Vec<PositionReport> {
        self.registry
            .list_players()
            .await
            .into_iter()
            .filter_map(|c| {
                c.last_position.map(|sample| PositionReport {
                    client_id: c.id,
                    sample,
                })
            })
            .collect()
    }

    /// Poll positions every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Drift monitor stopped");
    }
}
