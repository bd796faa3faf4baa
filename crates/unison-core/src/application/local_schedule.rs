//! LocalScheduler — the display side of a scheduled command.
//!
//! A display receives `sync_play`/`sync_pause` ahead of time and arms a timer
//! for the instant, translated from server time into its own clock with its
//! estimated offset. The offset is the mean of the recent `clock_sync_result`
//! measurements; until the first one arrives, a ping's `serverTime` against the
//! local receive time stands in. At most one timer is armed: a newer command cancels the
//! pending one. A command whose instant has already passed fires right away,
//! and a late play starts further into the video by the amount it is late.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::identity::CommandId;
use crate::domain::messages::{ClientMsg, ServerMsg};

use super::ports::{Clock, LocalPlayer};

/// Server-measured offsets averaged into the working estimate.
const OFFSET_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq)]
enum LocalAction {
    Play { url: String, video_time: f64 },
    Pause,
}

struct ArmedCommand {
    command_id: CommandId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LocalScheduler {
    player: Arc<dyn LocalPlayer>,
    clock: Arc<dyn Clock>,
    /// `local_clock - server_clock` in milliseconds.
    clock_offset_ms: AtomicI64,
    offset_samples: Mutex<VecDeque<f64>>,
    armed: Mutex<Option<ArmedCommand>>,
}

impl LocalScheduler {
    pub fn new(player: Arc<dyn LocalPlayer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            player,
            clock,
            clock_offset_ms: AtomicI64::new(0),
            offset_samples: Mutex::new(VecDeque::with_capacity(OFFSET_WINDOW)),
            armed: Mutex::new(None),
        }
    }

    pub fn set_clock_offset_ms(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms.load(Ordering::Relaxed)
    }

    fn to_local_ms(&self, server_ms: i64) -> i64 {
        server_ms + self.clock_offset_ms()
    }

    /// React to one server message; returns the reply to send, if any.
    pub async fn handle(&self, msg: &ServerMsg) -> Option<ClientMsg> {
        match msg {
            ServerMsg::ClockSyncPing {
                ping_id,
                server_time,
            } => {
                let now = self.clock.now_ms();
                if self.offset_samples.lock().await.is_empty() {
                    // Overestimates by the one-way latency; replaced by the first result.
                    self.set_clock_offset_ms(now - server_time);
                }
                Some(ClientMsg::ClockSyncResponse {
                    ping_id: *ping_id,
                    server_time: *server_time,
                    client_time: now,
                    response_time: now,
                })
            }

            ServerMsg::ClockSyncResult {
                ping_id,
                latency_ms,
                offset_ms,
            } => {
                let offset = {
                    let mut samples = self.offset_samples.lock().await;
                    if samples.len() == OFFSET_WINDOW {
                        samples.pop_front();
                    }
                    samples.push_back(*offset_ms);
                    samples.iter().sum::<f64>() / samples.len() as f64
                };
                self.set_clock_offset_ms(offset.round() as i64);
                debug!(?ping_id, latency_ms, offset_ms, mean_offset_ms = offset, "Clock offset updated");
                None
            }

            ServerMsg::SyncPreload {
                command_id,
                video_url,
            } => match self.player.preload(video_url).await {
                Ok((buffer_level, video_duration)) => Some(ClientMsg::SyncReady {
                    command_id: *command_id,
                    buffer_level,
                    video_duration,
                }),
                Err(e) => {
                    warn!(?command_id, %video_url, "Preload failed: {e}");
                    None
                }
            },

            ServerMsg::SyncPlay {
                command_id,
                video_url,
                video_time,
                scheduled_time,
            } => {
                self.arm(
                    *command_id,
                    *scheduled_time,
                    LocalAction::Play {
                        url: video_url.clone(),
                        video_time: *video_time,
                    },
                )
                .await;
                None
            }

            ServerMsg::SyncPause {
                command_id,
                scheduled_time,
            } => {
                self.arm(*command_id, *scheduled_time, LocalAction::Pause).await;
                None
            }

            ServerMsg::SyncCheckPosition => Some(ClientMsg::SyncReportPosition {
                current_time: self.player.position(),
            }),
        }
    }

    async fn arm(&self, command_id: CommandId, server_at_ms: i64, action: LocalAction) {
        let mut armed = self.armed.lock().await;
        if let Some(old) = armed.as_ref() {
            if old.command_id > command_id {
                debug!(?command_id, pending = ?old.command_id, "Ignoring older command");
                return;
            }
        }
        if let Some(old) = armed.take() {
            old.cancel.cancel();
            debug!(old = ?old.command_id, new = ?command_id, "Rescheduled pending command");
        }

        let local_at_ms = self.to_local_ms(server_at_ms);
        let delay_ms = (local_at_ms - self.clock.now_ms()).max(0) as u64;
        let cancel = CancellationToken::new();
        let player = Arc::clone(&self.player);
        let clock = Arc::clone(&self.clock);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            let late_ms = (clock.now_ms() - local_at_ms).max(0);
            let result = match &action {
                LocalAction::Play { url, video_time } => {
                    let position = video_time + late_ms as f64 / 1000.0;
                    info!(?command_id, %url, position, late_ms, "Starting playback");
                    player.play(url, position).await
                }
                LocalAction::Pause => {
                    info!(?command_id, late_ms, "Pausing playback");
                    player.pause().await
                }
            };
            if let Err(e) = result {
                warn!(?command_id, "Scheduled command failed: {e}");
            }
        });

        *armed = Some(ArmedCommand {
            command_id,
            cancel,
            task,
        });
    }

    /// The command whose timer is armed or has most recently fired.
    pub async fn armed_command(&self) -> Option<CommandId> {
        self.armed.lock().await.as_ref().map(|a| a.command_id)
    }

    /// Cancel the pending timer, if any, and wait for its task to finish.
    pub async fn cancel_pending(&self) {
        if let Some(armed) = self.armed.lock().await.take() {
            armed.cancel.cancel();
            let _ = armed.task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::clock::ManualClock;
    use crate::domain::identity::PingId;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingPlayer {
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingPlayer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocalPlayer for RecordingPlayer {
        async fn preload(&self, url: &str) -> anyhow::Result<(f64, Option<f64>)> {
            self.calls.lock().unwrap().push(format!("preload {url}"));
            Ok((0.8, Some(120.0)))
        }
        async fn play(&self, url: &str, position_seconds: f64) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("play {url} @{position_seconds:.2}"));
            Ok(())
        }
        async fn pause(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("pause".into());
            Ok(())
        }
        fn position(&self) -> f64 {
            42.0
        }
    }

    fn scheduler(now_ms: i64) -> (LocalScheduler, Arc<RecordingPlayer>, Arc<ManualClock>) {
        let player = Arc::new(RecordingPlayer::default());
        let clock = Arc::new(ManualClock::new(now_ms));
        (
            LocalScheduler::new(player.clone(), clock.clone()),
            player,
            clock,
        )
    }

    fn play(command: u64, scheduled_time: i64) -> ServerMsg {
        ServerMsg::SyncPlay {
            command_id: CommandId(command),
            video_url: "a.mp4".into(),
            video_time: 10.0,
            scheduled_time,
        }
    }

    #[tokio::test]
    async fn answers_ping_with_local_clock() {
        let (sched, _player, _clock) = scheduler(5_000);
        let reply = sched
            .handle(&ServerMsg::ClockSyncPing {
                ping_id: PingId(9),
                server_time: 4_000,
            })
            .await;
        assert_eq!(
            reply,
            Some(ClientMsg::ClockSyncResponse {
                ping_id: PingId(9),
                server_time: 4_000,
                client_time: 5_000,
                response_time: 5_000,
            })
        );
    }

    #[tokio::test]
    async fn preload_acknowledges_with_ready() {
        let (sched, player, _clock) = scheduler(0);
        let reply = sched
            .handle(&ServerMsg::SyncPreload {
                command_id: CommandId(3),
                video_url: "a.mp4".into(),
            })
            .await;
        assert_eq!(
            reply,
            Some(ClientMsg::SyncReady {
                command_id: CommandId(3),
                buffer_level: 0.8,
                video_duration: Some(120.0),
            })
        );
        assert_eq!(player.calls(), vec!["preload a.mp4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn play_fires_at_offset_adjusted_instant() {
        let (sched, player, _clock) = scheduler(1_000);
        // Local clock runs 200ms ahead: server 2_000 is local 2_200.
        sched.set_clock_offset_ms(200);
        sched.handle(&play(1, 2_000)).await;

        tokio::time::sleep(Duration::from_millis(1_150)).await;
        assert!(player.calls().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(player.calls(), vec!["play a.mp4 @10.00"]);
    }

    #[tokio::test(start_paused = true)]
    async fn display_clock_ahead_waits_for_server_instant() {
        // Local clock reads 5s ahead of the server.
        let (sched, player, _clock) = scheduler(105_000);
        sched
            .handle(&ServerMsg::ClockSyncPing {
                ping_id: PingId(1),
                server_time: 100_000,
            })
            .await;
        assert_eq!(sched.clock_offset_ms(), 5_000);

        sched.handle(&play(1, 101_000)).await;
        tokio::time::sleep(Duration::from_millis(990)).await;
        assert!(player.calls().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(player.calls(), vec!["play a.mp4 @10.00"]);
    }

    #[tokio::test(start_paused = true)]
    async fn measured_offsets_replace_ping_estimate() {
        let (sched, player, _clock) = scheduler(105_000);
        sched
            .handle(&ServerMsg::ClockSyncPing {
                ping_id: PingId(1),
                server_time: 100_000,
            })
            .await;
        for offset_ms in [4_980.0, 4_990.0] {
            let reply = sched
                .handle(&ServerMsg::ClockSyncResult {
                    ping_id: PingId(1),
                    latency_ms: 20.0,
                    offset_ms,
                })
                .await;
            assert!(reply.is_none());
        }
        assert_eq!(sched.clock_offset_ms(), 4_985);

        // Later pings no longer overwrite the measured estimate.
        sched
            .handle(&ServerMsg::ClockSyncPing {
                ping_id: PingId(2),
                server_time: 99_000,
            })
            .await;
        assert_eq!(sched.clock_offset_ms(), 4_985);

        sched.handle(&play(1, 101_000)).await;
        tokio::time::sleep(Duration::from_millis(980)).await;
        assert!(player.calls().is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(player.calls(), vec!["play a.mp4 @10.00"]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_command_cancels_pending_one() {
        let (sched, player, _clock) = scheduler(0);
        sched.handle(&play(1, 1_000)).await;
        sched
            .handle(&ServerMsg::SyncPause {
                command_id: CommandId(2),
                scheduled_time: 500,
            })
            .await;
        assert_eq!(sched.armed_command().await, Some(CommandId(2)));

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(player.calls(), vec!["pause"]);
    }

    #[tokio::test(start_paused = true)]
    async fn older_command_does_not_replace_newer() {
        let (sched, player, _clock) = scheduler(0);
        sched.handle(&play(5, 100)).await;
        sched.handle(&play(4, 50)).await;
        assert_eq!(sched.armed_command().await, Some(CommandId(5)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(player.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_play_skips_ahead() {
        let (sched, player, clock) = scheduler(0);
        clock.set(3_500);
        sched.handle(&play(1, 1_000)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(player.calls(), vec!["play a.mp4 @12.50"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_prevents_firing() {
        let (sched, player, _clock) = scheduler(0);
        sched.handle(&play(1, 1_000)).await;
        sched.cancel_pending().await;
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(player.calls().is_empty());
        assert!(sched.armed_command().await.is_none());
    }

    #[tokio::test]
    async fn position_check_reports_player_position() {
        let (sched, _player, _clock) = scheduler(0);
        let reply = sched.handle(&ServerMsg::SyncCheckPosition).await;
        assert_eq!(reply, Some(ClientMsg::SyncReportPosition { current_time: 42.0 }));
    }
}
