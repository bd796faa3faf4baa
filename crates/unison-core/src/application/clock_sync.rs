//! ClockSyncService — per-client round-trip latency and clock offset.
//!
//! Each round sends `clock_sync_ping { pingId, serverTime }` to every player.
//! The client echoes it with its own clock reading, and on receipt:
//!
//! - `roundTrip = serverNow - serverTime`
//! - `latency   = roundTrip / 2` (symmetric links assumed)
//! - `offset    = clientTime - (serverTime + latency)`
//!
//! Latency feeds the bounded per-client history; offset replaces the previous
//! estimate and is sent back to the client as `clock_sync_result`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::identity::{ClientId, PingId};
use crate::domain::messages::ServerMsg;

use super::broadcast::{self, BroadcastReport, Delivery};
use super::ports::Clock;
use super::registry::ClientRegistry;

/// Result of one ping/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockMeasurement {
    pub round_trip_ms: f64,
    pub latency_ms: f64,
    /// `client_clock - server_clock`; positive when the client runs ahead.
    pub offset_ms: f64,
}

impl ClockMeasurement {
    pub fn compute(server_time_ms: i64, client_time_ms: i64, server_now_ms: i64) -> Self {
        let round_trip_ms = (server_now_ms - server_time_ms).max(0) as f64;
        let latency_ms = round_trip_ms / 2.0;
        let offset_ms = client_time_ms as f64 - (server_time_ms as f64 + latency_ms);
        Self {
            round_trip_ms,
            latency_ms,
            offset_ms,
        }
    }
}

struct PendingPing {
    client_id: ClientId,
    sent_at_ms: i64,
}

pub struct ClockSyncService {
    registry: Arc<ClientRegistry>,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<PingId, PendingPing>>,
    ping_timeout_ms: i64,
}

impl ClockSyncService {
    pub fn new(registry: Arc<ClientRegistry>, clock: Arc<dyn Clock>, ping_timeout: Duration) -> Self {
        Self {
            registry,
            clock,
            pending: Mutex::new(HashMap::new()),
            ping_timeout_ms: ping_timeout.as_millis() as i64,
        }
    }

    /// Ping one client. Unknown ids yield [`Delivery::Skipped`].
    pub async fn ping_client(&self, id: &ClientId) -> Delivery {
        let Some(recipient) = self.registry.recipient(id).await else {
            return Delivery::Skipped;
        };
        let ping_id = PingId(rand::random());
        let sent_at_ms = self.clock.now_ms();
        self.pending.lock().await.insert(
            ping_id,
            PendingPing {
                client_id: id.clone(),
                sent_at_ms,
            },
        );

        let msg = ServerMsg::ClockSyncPing {
            ping_id,
            server_time: sent_at_ms,
        };
        let delivery = broadcast::send_to(&recipient, &msg).await;
        if delivery != Delivery::Sent {
            self.pending.lock().await.remove(&ping_id);
        }
        delivery
    }

    /// Ping every player once.
    pub async fn run_round(&self) -> BroadcastReport {
        self.prune_expired().await;
        let recipients = self.registry.player_recipients().await;
        let mut report = BroadcastReport {
            deliveries: Vec::with_capacity(recipients.len()),
        };
        for recipient in &recipients {
            let delivery = self.ping_client(&recipient.id).await;
            report.deliveries.push((recipient.id.clone(), delivery));
        }
        debug!(
            players = recipients.len(),
            sent = report.sent_count(),
            "Clock sync round"
        );
        report
    }

    /// Absorb a `clock_sync_response`. Responses for unknown pings, pings
    /// issued to a different client, or clients no longer registered are
    /// ignored.
    pub async fn handle_response(
        &self,
        from: &ClientId,
        ping_id: PingId,
        echoed_server_time: i64,
        client_time: i64,
    ) -> Option<ClockMeasurement> {
        let pending = {
            let mut pending = self.pending.lock().await;
            match pending.get(&ping_id).map(|p| &p.client_id == from) {
                Some(true) => pending.remove(&ping_id)?,
                Some(false) => {
                    debug!(client_id = %from, ?ping_id, "Ping response from wrong client ignored");
                    return None;
                }
                None => {
                    debug!(client_id = %from, ?ping_id, "Response for unknown ping ignored");
                    return None;
                }
            }
        };
        if pending.sent_at_ms != echoed_server_time {
            debug!(
                client_id = %from,
                sent_at = pending.sent_at_ms,
                echoed = echoed_server_time,
                "Echoed server time differs from send time; using send time"
            );
        }

        let now = self.clock.now_ms();
        let measurement = ClockMeasurement::compute(pending.sent_at_ms, client_time, now);
        if !self
            .registry
            .record_sync(from, measurement.latency_ms, measurement.offset_ms, now)
            .await
        {
            return None;
        }
        debug!(
            client_id = %from,
            latency_ms = measurement.latency_ms,
            offset_ms = measurement.offset_ms,
            "Clock sync updated"
        );

        // The display needs the offset to place scheduled instants on its own clock.
        if let Some(recipient) = self.registry.recipient(from).await {
            let result = ServerMsg::ClockSyncResult {
                ping_id,
                latency_ms: measurement.latency_ms,
                offset_ms: measurement.offset_ms,
            };
            broadcast::send_to(&recipient, &result).await;
        }
        Some(measurement)
    }

    /// Drop outstanding pings addressed to `id`.
    pub async fn forget_client(&self, id: &ClientId) {
        self.pending.lock().await.retain(|_, p| &p.client_id != id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn clear(&self) {
        self.pending.lock().await.clear();
    }

    async fn prune_expired(&self) {
        let cutoff = self.clock.now_ms() - self.ping_timeout_ms;
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.sent_at_ms >= cutoff);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(dropped, "Expired unanswered pings");
        }
    }

    /// Run sync rounds every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_round().await;
                }
            }
        }
        info!("Clock sync loop stopped");
    }
}
