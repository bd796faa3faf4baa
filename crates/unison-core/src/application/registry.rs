//! ClientRegistry — connected endpoints, their role, and per-client sync metrics.
//!
//! The registry is the only owner of per-client state. Components read it
//! through snapshots and recipient lists taken at the moment they need them,
//! so a client joining or leaving mid-operation is picked up by the next
//! broadcast rather than a cached list.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::identity::{ClientId, ClientRole, CommandId};

use super::broadcast::Recipient;
use super::ports::ClientConnection;

// ---------------------------------------------------------------------------
// Per-client record
// ---------------------------------------------------------------------------

/// A playback position reported by a client, with the drift computed on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub position_seconds: f64,
    pub received_at_ms: i64,
    /// Reported minus expected position, in milliseconds. `None` when no
    /// timeline was active.
    pub drift_ms: Option<f64>,
}

/// The most recent `sync_ready` report from a client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyReport {
    pub command_id: CommandId,
    pub received_at_ms: i64,
    /// False when the report named a command other than the awaited one.
    pub current: bool,
}

struct ClientRecord {
    display_name: String,
    role: ClientRole,
    capabilities: Vec<String>,
    connection: Arc<dyn ClientConnection>,
    latency_samples: VecDeque<f64>,
    clock_offset_ms: Option<f64>,
    buffer_level: Option<f64>,
    reported_duration: Option<f64>,
    last_ready: Option<ReadyReport>,
    last_position: Option<PositionSample>,
    last_activity_at_ms: i64,
}

impl ClientRecord {
    fn mean_latency(&self) -> Option<f64> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let sum: f64 = self.latency_samples.iter().sum();
        Some(sum / self.latency_samples.len() as f64)
    }

    fn worst_latency(&self) -> Option<f64> {
        self.latency_samples.iter().copied().reduce(f64::max)
    }
}

/// Read-only view of one client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub id: ClientId,
    pub display_name: String,
    pub role: ClientRole,
    pub capabilities: Vec<String>,
    pub connected: bool,
    pub latency_samples: Vec<f64>,
    pub clock_offset_ms: Option<f64>,
    pub buffer_level: Option<f64>,
    pub reported_duration: Option<f64>,
    pub last_ready: Option<ReadyReport>,
    pub last_position: Option<PositionSample>,
    pub last_activity_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientRecord>>,
    latency_history: usize,
}

impl ClientRegistry {
    pub fn new(latency_history: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            latency_history: latency_history.max(1),
        }
    }

    /// Insert or overwrite the client with this id. Returns the connection
    /// of the record it replaced.
    pub async fn register(
        &self,
        id: ClientId,
        connection: Arc<dyn ClientConnection>,
        display_name: String,
        role: ClientRole,
        now_ms: i64,
    ) -> Option<Arc<dyn ClientConnection>> {
        let record = ClientRecord {
            display_name,
            role,
            capabilities: Vec::new(),
            connection,
            latency_samples: VecDeque::with_capacity(self.latency_history),
            clock_offset_ms: None,
            buffer_level: None,
            reported_duration: None,
            last_ready: None,
            last_position: None,
            last_activity_at_ms: now_ms,
        };
        let replaced = self
            .clients
            .write()
            .await
            .insert(id.clone(), record)
            .map(|old| old.connection);
        info!(client_id = %id, %role, replaced = replaced.is_some(), "Client registered");
        replaced
    }

    /// Update name/role/capabilities of a registered client. Returns the
    /// previous role, or `None` if the id is unknown.
    pub async fn identify(
        &self,
        id: &ClientId,
        display_name: Option<String>,
        role: ClientRole,
        capabilities: Vec<String>,
        now_ms: i64,
    ) -> Option<ClientRole> {
        let mut clients = self.clients.write().await;
        let record = clients.get_mut(id)?;
        let previous = record.role;
        record.role = role;
        record.capabilities = capabilities;
        if let Some(name) = display_name {
            record.display_name = name;
        }
        record.last_activity_at_ms = now_ms;
        if previous != role {
            info!(client_id = %id, from = %previous, to = %role, "Client re-classified");
        }
        Some(previous)
    }

    /// Remove the client. Unknown ids are a no-op.
    pub async fn unregister(&self, id: &ClientId) -> bool {
        let removed = self.clients.write().await.remove(id).is_some();
        if removed {
            info!(client_id = %id, "Client unregistered");
        } else {
            debug!(client_id = %id, "Unregister for unknown client ignored");
        }
        removed
    }

    pub async fn contains(&self, id: &ClientId) -> bool {
        self.clients.read().await.contains_key(id)
    }

    pub async fn role_of(&self, id: &ClientId) -> Option<ClientRole> {
        self.clients.read().await.get(id).map(|r| r.role)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn player_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|r| r.role.is_player())
            .count()
    }

    /// Snapshots of `role = player` clients.
    pub async fn list_players(&self) -> Vec<ClientSnapshot> {
        let clients = self.clients.read().await;
        let mut players: Vec<ClientSnapshot> = clients
            .iter()
            .filter(|(_, r)| r.role.is_player())
            .map(|(id, r)| snapshot(id, r))
            .collect();
        players.sort_by(|a, b| a.id.cmp(&b.id));
        players
    }

    pub async fn snapshot(&self, id: &ClientId) -> Option<ClientSnapshot> {
        self.clients.read().await.get(id).map(|r| snapshot(id, r))
    }

    /// Addressable player connections as of now.
    pub async fn player_recipients(&self) -> Vec<Recipient> {
        self.clients
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.role.is_player())
            .map(|(id, r)| Recipient {
                id: id.clone(),
                connection: Arc::clone(&r.connection),
            })
            .collect()
    }

    pub async fn recipient(&self, id: &ClientId) -> Option<Recipient> {
        self.clients.read().await.get(id).map(|r| Recipient {
            id: id.clone(),
            connection: Arc::clone(&r.connection),
        })
    }

    /// Absorb one clock-sync measurement. Returns false for unknown ids.
    pub async fn record_sync(
        &self,
        id: &ClientId,
        latency_ms: f64,
        offset_ms: f64,
        now_ms: i64,
    ) -> bool {
        let mut clients = self.clients.write().await;
        let Some(record) = clients.get_mut(id) else {
            return false;
        };
        if record.latency_samples.len() == self.latency_history {
            record.latency_samples.pop_front();
        }
        record.latency_samples.push_back(latency_ms);
        record.clock_offset_ms = Some(offset_ms);
        record.last_activity_at_ms = now_ms;
        true
    }

    /// Store a readiness report. Returns false for unknown ids.
    pub async fn record_ready(
        &self,
        id: &ClientId,
        report: ReadyReport,
        buffer_level: f64,
        duration: Option<f64>,
    ) -> bool {
        let mut clients = self.clients.write().await;
        let Some(record) = clients.get_mut(id) else {
            return false;
        };
        record.buffer_level = Some(buffer_level);
        if duration.is_some() {
            record.reported_duration = duration;
        }
        record.last_activity_at_ms = report.received_at_ms;
        record.last_ready = Some(report);
        true
    }

    /// Store a position report. Returns false for unknown ids.
    pub async fn record_position(&self, id: &ClientId, sample: PositionSample) -> bool {
        let mut clients = self.clients.write().await;
        let Some(record) = clients.get_mut(id) else {
            return false;
        };
        record.last_activity_at_ms = sample.received_at_ms;
        record.last_position = Some(sample);
        true
    }

    pub async fn mean_latency_of(&self, id: &ClientId) -> Option<f64> {
        self.clients.read().await.get(id).and_then(|r| r.mean_latency())
    }

    /// Largest latency sample held for any of `ids`; 0 when none are known.
    pub async fn worst_latency(&self, ids: &[ClientId]) -> f64 {
        let clients = self.clients.read().await;
        ids.iter()
            .filter_map(|id| clients.get(id))
            .filter_map(|r| r.worst_latency())
            .fold(0.0, f64::max)
    }

    /// Mean of per-player mean latencies, over players with samples.
    pub async fn average_latency(&self) -> Option<f64> {
        let clients = self.clients.read().await;
        let means: Vec<f64> = clients
            .values()
            .filter(|r| r.role.is_player())
            .filter_map(|r| r.mean_latency())
            .collect();
        if means.is_empty() {
            return None;
        }
        Some(means.iter().sum::<f64>() / means.len() as f64)
    }

    /// Remove every client, returning their connections.
    pub async fn clear(&self) -> Vec<Arc<dyn ClientConnection>> {
        let mut clients = self.clients.write().await;
        clients.drain().map(|(_, r)| r.connection).collect()
    }
}

fn snapshot(id: &ClientId, r: &ClientRecord) -> ClientSnapshot {
    ClientSnapshot {
        id: id.clone(),
        display_name: r.display_name.clone(),
        role: r.role,
        capabilities: r.capabilities.clone(),
        connected: r.connection.is_open(),
        latency_samples: r.latency_samples.iter().copied().collect(),
        clock_offset_ms: r.clock_offset_ms,
        buffer_level: r.buffer_level,
        reported_duration: r.reported_duration,
        last_ready: r.last_ready,
        last_position: r.last_position,
        last_activity_at_ms: r.last_activity_at_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::channel::ChannelConnection;

    fn conn() -> Arc<dyn ClientConnection> {
        Arc::new(ChannelConnection::pair().0)
    }

    #[tokio::test]
    async fn register_same_id_twice_counts_once() {
        let registry = ClientRegistry::new(4);
        let id = ClientId::new("tv-1");
        let first = conn();
        assert!(registry
            .register(id.clone(), Arc::clone(&first), "TV".into(), ClientRole::Player, 0)
            .await
            .is_none());
        let replaced = registry
            .register(id.clone(), conn(), "TV again".into(), ClientRole::Control, 0)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.player_count().await, 0);
        assert_eq!(registry.role_of(&id).await, Some(ClientRole::Control));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ClientRegistry::new(4);
        let id = ClientId::new("tv-1");
        registry
            .register(id.clone(), conn(), "TV".into(), ClientRole::Player, 0)
            .await;
        assert!(registry.unregister(&id).await);
        assert!(!registry.unregister(&id).await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn list_players_filters_roles() {
        let registry = ClientRegistry::new(4);
        for (name, role) in [
            ("a", ClientRole::Player),
            ("b", ClientRole::Control),
            ("c", ClientRole::SingerDisplay),
            ("d", ClientRole::Player),
        ] {
            registry
                .register(ClientId::new(name), conn(), name.into(), role, 0)
                .await;
        }
        let ids: Vec<String> = registry
            .list_players()
            .await
            .into_iter()
            .map(|c| c.id.0)
            .collect();
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(registry.player_recipients().await.len(), 2);
    }

    #[tokio::test]
    async fn latency_history_is_bounded() {
        let registry = ClientRegistry::new(3);
        let id = ClientId::new("tv");
        registry
            .register(id.clone(), conn(), "TV".into(), ClientRole::Player, 0)
            .await;
        for sample in [10.0, 20.0, 30.0, 40.0] {
            assert!(registry.record_sync(&id, sample, 5.0, 0).await);
        }
        let snap = registry.snapshot(&id).await.unwrap();
        assert_eq!(snap.latency_samples, vec![20.0, 30.0, 40.0]);
        assert_eq!(snap.clock_offset_ms, Some(5.0));
        assert_eq!(registry.worst_latency(&[id.clone()]).await, 40.0);
        assert_eq!(registry.mean_latency_of(&id).await, Some(30.0));
    }

    #[tokio::test]
    async fn metrics_for_unknown_ids_are_ignored() {
        let registry = ClientRegistry::new(3);
        let ghost = ClientId::new("ghost");
        assert!(!registry.record_sync(&ghost, 1.0, 0.0, 0).await);
        assert_eq!(registry.worst_latency(&[ghost]).await, 0.0);
        assert!(registry.average_latency().await.is_none());
    }
}
