//! PlaybackScheduler — picks a common future instant and broadcasts
//! play/pause to every player.
//!
//! A play command runs:
//! 1. Preload barrier over the current players.
//! 2. Re-read the player set, take the worst latency sample among them.
//! 3. `scheduledAt = now + minimumBuffer + worstLatency * safetyFactor`.
//! 4. Broadcast one identical `sync_play` to every open player.
//! 5. Commit the new timeline to [`SyncState`].
//!
//! Command ids are allocated under the state write lock, so the order of ids
//! is the order in which commands claimed the state. A command that is
//! superseded while it waits on the barrier is dropped without broadcasting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::domain::identity::{ClientId, CommandId};
use crate::domain::messages::ServerMsg;
use crate::domain::playback::{CommandKind, ScheduledCommand, SyncState};

use super::broadcast::{self, BroadcastReport, Delivery};
use super::ports::Clock;
use super::readiness::{ReadinessBarrier, ReadinessOutcome, ReadinessResult};
use super::registry::ClientRegistry;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayOutcome {
    pub started: bool,
    pub command: Option<ScheduledCommand>,
    pub readiness: Option<ReadinessResult>,
    pub report: BroadcastReport,
}

impl PlayOutcome {
    fn not_started(readiness: Option<ReadinessResult>) -> Self {
        Self {
            started: false,
            command: None,
            readiness,
            report: BroadcastReport::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseOutcome {
    /// Always true: pause is best-effort.
    pub paused: bool,
    pub command: ScheduledCommand,
    pub report: BroadcastReport,
}

pub struct PlaybackScheduler {
    registry: Arc<ClientRegistry>,
    barrier: Arc<ReadinessBarrier>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<SyncState>>,
    config: SyncConfig,
    next_command: AtomicU64,
}

impl PlaybackScheduler {
    pub fn new(
        registry: Arc<ClientRegistry>,
        barrier: Arc<ReadinessBarrier>,
        clock: Arc<dyn Clock>,
        state: Arc<RwLock<SyncState>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            barrier,
            clock,
            state,
            config,
            next_command: AtomicU64::new(1),
        }
    }

    /// Only call with the state write lock held.
    fn next_command_id(&self) -> CommandId {
        CommandId(self.next_command.fetch_add(1, Ordering::Relaxed))
    }

    /// Start `url` at `start_position` seconds on every player at one instant.
    ///
    /// Not started when there are no players, or when a newer play/pause
    /// replaced this one while it waited for readiness.
    pub async fn play_video(&self, url: &str, start_position: f64) -> PlayOutcome {
        let players = self.registry.player_recipients().await;
        if players.is_empty() {
            info!(%url, "Play requested with no player clients");
            return PlayOutcome::not_started(None);
        }

        let command_id = {
            let mut state = self.state.write().await;
            let command_id = self.next_command_id();
            state.begin_scheduling(command_id);
            command_id
        };
        info!(?command_id, %url, start_position, players = players.len(), "Scheduling play");

        let readiness = self.barrier.await_readiness(command_id, &players, url).await;
        if readiness.outcome == ReadinessOutcome::Superseded
            || !self.state.read().await.is_active(command_id)
        {
            debug!(?command_id, "Play superseded before broadcast");
            return PlayOutcome::not_started(Some(readiness));
        }

        // Membership may have changed during the wait.
        let players = self.registry.player_recipients().await;
        if players.is_empty() {
            self.state.write().await.abandon_scheduling(command_id);
            info!(?command_id, "All players left before play could be broadcast");
            return PlayOutcome::not_started(Some(readiness));
        }
        let ids: Vec<ClientId> = players.iter().map(|p| p.id.clone()).collect();
        let worst_latency_ms = self.registry.worst_latency(&ids).await;
        let buffer_ms = self.config.coordination_buffer_ms(worst_latency_ms);
        let scheduled_at_ms = self.clock.now_ms() + buffer_ms;

        let msg = ServerMsg::SyncPlay {
            command_id,
            video_url: url.to_string(),
            video_time: start_position,
            scheduled_time: scheduled_at_ms,
        };
        let report = broadcast::broadcast(&players, &msg).await;

        {
            let mut state = self.state.write().await;
            if state.is_active(command_id) {
                state.start_playing(
                    command_id,
                    url,
                    start_position,
                    scheduled_at_ms,
                    readiness.video_duration,
                );
            }
        }
        info!(
            ?command_id,
            scheduled_at_ms,
            buffer_ms,
            worst_latency_ms,
            sent = report.sent_count(),
            ready = readiness.ready_count,
            "Play scheduled"
        );

        PlayOutcome {
            started: true,
            command: Some(ScheduledCommand {
                command_id,
                kind: CommandKind::Play,
                scheduled_at_ms,
                video_position_seconds: Some(start_position),
            }),
            readiness: Some(readiness),
            report,
        }
    }

    /// Pause every player shortly from now. Cancels any pending play.
    pub async fn pause(&self) -> PauseOutcome {
        let (command_id, scheduled_at_ms) = {
            let mut state = self.state.write().await;
            let command_id = self.next_command_id();
            let scheduled_at_ms = self.clock.now_ms() + self.config.pause_buffer_ms as i64;
            state.pause(command_id, scheduled_at_ms);
            (command_id, scheduled_at_ms)
        };
        self.barrier.supersede_through(command_id).await;

        let players = self.registry.player_recipients().await;
        let report = broadcast::broadcast(
            &players,
            &ServerMsg::SyncPause {
                command_id,
                scheduled_time: scheduled_at_ms,
            },
        )
        .await;
        info!(?command_id, scheduled_at_ms, sent = report.sent_count(), "Pause scheduled");

        PauseOutcome {
            paused: true,
            command: ScheduledCommand {
                command_id,
                kind: CommandKind::Pause,
                scheduled_at_ms,
                video_position_seconds: None,
            },
            report,
        }
    }

    /// Continue the paused video from where the timeline stopped.
    pub async fn resume(&self) -> PlayOutcome {
        let resume_point = self.state.read().await.resume_point();
        match resume_point {
            Some((url, position)) => self.play_video(&url, position).await,
            None => {
                debug!("Resume requested while not paused");
                PlayOutcome::not_started(None)
            }
        }
    }

    /// Bring a player that joined mid-playback onto the running timeline.
    ///
    /// Returns `None` when nothing is playing or the client is unknown.
    pub async fn catch_up(&self, id: &ClientId) -> Option<Delivery> {
        let (command_id, url, timeline) = {
            let state = self.state.read().await;
            if !state.is_playing() {
                return None;
            }
            (
                state.active_command_id()?,
                state.current_video()?.url.clone(),
                state.timeline()?,
            )
        };
        let recipient = self.registry.recipient(id).await?;

        let worst_latency_ms = self.registry.worst_latency(std::slice::from_ref(id)).await;
        let scheduled_at_ms =
            self.clock.now_ms() + self.config.coordination_buffer_ms(worst_latency_ms);
        let msg = ServerMsg::SyncPlay {
            command_id,
            video_url: url,
            video_time: timeline.position_at(scheduled_at_ms),
            scheduled_time: scheduled_at_ms,
        };
        let delivery = broadcast::send_to(&recipient, &msg).await;
        info!(client_id = %id, ?command_id, scheduled_at_ms, ?delivery, "Late joiner caught up");
        Some(delivery)
    }
}
