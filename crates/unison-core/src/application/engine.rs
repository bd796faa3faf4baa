//! SyncEngine — one explicit instance owning the registry, playback state and
//! the components that act on them.
//!
//! The host constructs it once, hands it each client's connection on connect,
//! feeds it decoded [`ClientMsg`]s, and calls [`SyncEngine::shutdown`] on exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::domain::identity::{ClientId, ClientRole, CommandId, PingId};
use crate::domain::messages::ClientMsg;
use crate::domain::playback::{CurrentVideo, PlaybackPhase, SyncState};

use super::clock_sync::{ClockMeasurement, ClockSyncService};
use super::drift::{DriftMonitor, PositionReport};
use super::ports::{ClientConnection, Clock};
use super::readiness::{ReadinessBarrier, ReadyDisposition};
use super::registry::{ClientRegistry, ClientSnapshot, PositionSample};
use super::scheduler::{PauseOutcome, PlayOutcome, PlaybackScheduler};

/// Read-only snapshot for observability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub total_clients: usize,
    pub player_clients: usize,
    /// Mean of per-player mean latencies; `None` before any sync round.
    pub average_latency: Option<f64>,
    pub is_playing: bool,
    pub current_video: Option<CurrentVideo>,
    pub phase: PlaybackPhase,
    pub active_command_id: Option<CommandId>,
    /// Play command whose readiness barrier is armed.
    pub awaiting_readiness: Option<CommandId>,
    pub stale_ready_reports: u64,
    pub pending_pings: usize,
}

pub struct SyncEngine {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<ClientRegistry>,
    state: Arc<RwLock<SyncState>>,
    clock_sync: Arc<ClockSyncService>,
    barrier: Arc<ReadinessBarrier>,
    scheduler: Arc<PlaybackScheduler>,
    drift: Arc<DriftMonitor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new(config.latency_history));
        let state = Arc::new(RwLock::new(SyncState::new()));
        let clock_sync = Arc::new(ClockSyncService::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            std::time::Duration::from_millis(config.ping_timeout_ms),
        ));
        let barrier = Arc::new(ReadinessBarrier::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.readiness_timeout(),
        ));
        let scheduler = Arc::new(PlaybackScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&barrier),
            Arc::clone(&clock),
            Arc::clone(&state),
            config.clone(),
        ));
        let drift = Arc::new(DriftMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&state),
            Arc::clone(&clock),
            config.drift_warn_threshold_ms,
        ));

        Arc::new(Self {
            config,
            clock,
            registry,
            state,
            clock_sync,
            barrier,
            scheduler,
            drift,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Spawn the clock-sync and drift loops. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() || self.shut_down.load(Ordering::Acquire) {
            return;
        }

        let clock_sync = Arc::clone(&self.clock_sync);
        let interval = self.config.clock_sync_interval();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            clock_sync.run(interval, cancel).await;
        }));

        let drift = Arc::clone(&self.drift);
        let interval = self.config.drift_check_interval();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            drift.run(interval, cancel).await;
        }));

        info!(
            clock_sync_interval_ms = self.config.clock_sync_interval_ms,
            drift_check_interval_ms = self.config.drift_check_interval_ms,
            "Sync engine started"
        );
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Register (or re-register) a client. Players get an immediate clock
    /// sync ping, and are caught up if something is already playing.
    ///
    /// Re-registering an id closes the connection it replaces and drops the
    /// old connection's pending ping and barrier slot. After shutdown the
    /// connection is closed and `false` is returned.
    pub async fn register_client(
        &self,
        id: ClientId,
        connection: Arc<dyn ClientConnection>,
        display_name: impl Into<String>,
        role: ClientRole,
    ) -> bool {
        if self.is_shut_down() {
            warn!(client_id = %id, "Registration refused after shutdown");
            connection.close();
            return false;
        }

        let now = self.clock_now();
        let replaced = self
            .registry
            .register(id.clone(), Arc::clone(&connection), display_name.into(), role, now)
            .await;
        if let Some(old) = replaced {
            self.clock_sync.forget_client(&id).await;
            self.barrier.forget_client(&id).await;
            if !std::ptr::addr_eq(Arc::as_ptr(&old), Arc::as_ptr(&connection)) {
                debug!(client_id = %id, "Closing replaced connection");
                old.close();
            }
        }

        // Shutdown may have cleared the registry while this one was inserted.
        if self.is_shut_down() {
            self.unregister_client(&id).await;
            connection.close();
            return false;
        }

        if role.is_player() {
            self.on_player_joined(&id).await;
        }
        true
    }

    /// Remove a client. Unknown ids are a no-op.
    pub async fn unregister_client(&self, id: &ClientId) -> bool {
        let removed = self.registry.unregister(id).await;
        self.clock_sync.forget_client(id).await;
        self.barrier.forget_client(id).await;
        removed
    }

    async fn on_player_joined(&self, id: &ClientId) {
        self.clock_sync.ping_client(id).await;
        self.scheduler.catch_up(id).await;
    }

    fn clock_now(&self) -> i64 {
        self.clock.now_ms()
    }

    // -----------------------------------------------------------------------
    // Playback control surface
    // -----------------------------------------------------------------------

    pub async fn play_video(&self, url: &str, start_position: f64) -> PlayOutcome {
        self.scheduler.play_video(url, start_position).await
    }

    pub async fn pause(&self) -> PauseOutcome {
        self.scheduler.pause().await
    }

    pub async fn resume(&self) -> PlayOutcome {
        self.scheduler.resume().await
    }

    // -----------------------------------------------------------------------
    // Inbound handlers
    // -----------------------------------------------------------------------

    pub async fn handle_clock_sync_response(
        &self,
        id: &ClientId,
        ping_id: PingId,
        server_time: i64,
        client_time: i64,
    ) -> Option<ClockMeasurement> {
        self.clock_sync
            .handle_response(id, ping_id, server_time, client_time)
            .await
    }

    pub async fn handle_client_ready(
        &self,
        id: &ClientId,
        command_id: CommandId,
        buffer_level: f64,
        duration: Option<f64>,
    ) -> ReadyDisposition {
        let disposition = self
            .barrier
            .handle_client_ready(id, command_id, buffer_level, duration)
            .await;
        if let (ReadyDisposition::Stale, Some(d)) = (disposition, duration) {
            // Late ready for the command that is already playing.
            self.state.write().await.learn_duration(command_id, d);
        }
        disposition
    }

    pub async fn handle_position_report(
        &self,
        id: &ClientId,
        current_time: f64,
    ) -> Option<PositionSample> {
        self.drift.handle_position_report(id, current_time).await
    }

    /// Dispatch one decoded message from `id`.
    pub async fn handle_message(self: &Arc<Self>, id: &ClientId, msg: ClientMsg) {
        debug!(client_id = %id, kind = msg.kind(), "Inbound message");
        match msg {
            ClientMsg::ClientIdentify {
                role,
                display_name,
                capabilities,
            } => {
                let now = self.clock_now();
                let previous = self
                    .registry
                    .identify(id, display_name, role, capabilities, now)
                    .await;
                match previous {
                    Some(previous) if !previous.is_player() && role.is_player() => {
                        self.on_player_joined(id).await;
                    }
                    Some(_) => {}
                    None => debug!(client_id = %id, "Identify from unregistered client ignored"),
                }
            }

            ClientMsg::ClockSyncResponse {
                ping_id,
                server_time,
                client_time,
                ..
            } => {
                self.handle_clock_sync_response(id, ping_id, server_time, client_time)
                    .await;
            }

            ClientMsg::SyncReady {
                command_id,
                buffer_level,
                video_duration,
            } => {
                self.handle_client_ready(id, command_id, buffer_level, video_duration)
                    .await;
            }

            ClientMsg::SyncReportPosition { current_time } => {
                self.handle_position_report(id, current_time).await;
            }

            ClientMsg::ControlPlay {
                video_url,
                video_time,
            } => {
                if self.authorize_control(id).await {
                    // The readiness wait must not stall this client's reads.
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.play_video(&video_url, video_time).await;
                    });
                }
            }

            ClientMsg::ControlPause => {
                if self.authorize_control(id).await {
                    self.pause().await;
                }
            }

            ClientMsg::ControlResume => {
                if self.authorize_control(id).await {
                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.resume().await;
                    });
                }
            }
        }
    }

    async fn authorize_control(&self, id: &ClientId) -> bool {
        let role = self.registry.role_of(id).await;
        if role == Some(ClientRole::Control) {
            return true;
        }
        warn!(client_id = %id, ?role, "Control request from non-control client ignored");
        false
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> EngineStats {
        let (is_playing, current_video, phase, active_command_id) = {
            let state = self.state.read().await;
            (
                state.is_playing(),
                state.current_video().cloned(),
                state.phase(),
                state.active_command_id(),
            )
        };
        EngineStats {
            total_clients: self.registry.len().await,
            player_clients: self.registry.player_count().await,
            average_latency: self.registry.average_latency().await,
            is_playing,
            current_video,
            phase,
            active_command_id,
            awaiting_readiness: self.barrier.awaited_command().await,
            stale_ready_reports: self.barrier.stale_report_count(),
            pending_pings: self.clock_sync.pending_count().await,
        }
    }

    pub async fn list_players(&self) -> Vec<ClientSnapshot> {
        self.registry.list_players().await
    }

    pub async fn latest_positions(&self) -> Vec<PositionReport> {
        self.drift.latest_positions().await
    }

    /// Run one drift check now, outside the periodic loop.
    pub async fn check_drift_now(&self) {
        self.drift.tick().await;
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop the loops, abandon any readiness wait, close and forget every
    /// client. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("Sync engine already shut down");
            return;
        }
        self.cancel.cancel();
        self.barrier.cancel_active().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {e}");
            }
        }

        let connections = self.registry.clear().await;
        for connection in &connections {
            connection.close();
        }
        self.clock_sync.clear().await;
        info!(closed = connections.len(), "Sync engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}
