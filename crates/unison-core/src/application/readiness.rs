//! ReadinessBarrier — wait, with a bound, for players to confirm a preload.
//!
//! Only one barrier is armed at a time. Arming a new one (or calling
//! [`ReadinessBarrier::cancel_active`]) cancels the previous wait, which then
//! resolves as [`ReadinessOutcome::Superseded`]; nothing ever blocks on an old
//! command. Command ids only move forward: a barrier for an id at or below
//! the newest one seen resolves as superseded without being armed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::identity::{ClientId, CommandId};
use crate::domain::messages::ServerMsg;

use super::broadcast::{self, BroadcastReport, Delivery, Recipient};
use super::ports::Clock;
use super::registry::{ClientRegistry, ReadyReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BarrierProgress {
    ready: usize,
    expected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessOutcome {
    AllReady,
    /// The bound elapsed first. Not an error: playback proceeds anyway.
    TimedOut,
    /// A newer command replaced this barrier before it resolved.
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResult {
    pub command_id: CommandId,
    pub ready_count: usize,
    /// Players the preload actually reached.
    pub expected: usize,
    pub outcome: ReadinessOutcome,
    /// Largest media duration reported for this command.
    pub video_duration: Option<f64>,
    pub preload: BroadcastReport,
}

/// How a `sync_ready` report was treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyDisposition {
    Counted,
    /// Recorded for diagnostics; does not satisfy any barrier.
    Stale,
    UnknownClient,
}

struct ActiveBarrier {
    command_id: CommandId,
    targets: HashSet<ClientId>,
    ready: HashSet<ClientId>,
    video_duration: Option<f64>,
    progress: watch::Sender<BarrierProgress>,
    cancel: CancellationToken,
}

impl ActiveBarrier {
    fn publish(&self) {
        let ready = self.ready.intersection(&self.targets).count();
        self.progress.send_replace(BarrierProgress {
            ready,
            expected: self.targets.len(),
        });
    }
}

pub struct ReadinessBarrier {
    registry: Arc<ClientRegistry>,
    clock: Arc<dyn Clock>,
    active: Mutex<Option<ActiveBarrier>>,
    /// Newest command id armed or superseded. Written under `active`.
    high_water: AtomicU64,
    timeout: Duration,
    stale_reports: AtomicU64,
}

impl ReadinessBarrier {
    pub fn new(registry: Arc<ClientRegistry>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            registry,
            clock,
            active: Mutex::new(None),
            high_water: AtomicU64::new(0),
            timeout,
            stale_reports: AtomicU64::new(0),
        }
    }

    /// Send `sync_preload` to `players` and wait until all of them report
    /// ready for `command_id`, the timeout elapses, or a newer barrier
    /// supersedes this one.
    pub async fn await_readiness(
        &self,
        command_id: CommandId,
        players: &[Recipient],
        video_url: &str,
    ) -> ReadinessResult {
        let targets: HashSet<ClientId> = players.iter().map(|p| p.id.clone()).collect();
        let (progress_tx, mut progress_rx) = watch::channel(BarrierProgress {
            ready: 0,
            expected: targets.len(),
        });
        let cancel = CancellationToken::new();

        {
            let mut active = self.active.lock().await;
            let newest = self.high_water.load(Ordering::Acquire);
            if command_id.0 <= newest {
                debug!(?command_id, newest, "Readiness requested for an outdated command");
                return ReadinessResult {
                    command_id,
                    ready_count: 0,
                    expected: 0,
                    outcome: ReadinessOutcome::Superseded,
                    video_duration: None,
                    preload: BroadcastReport::default(),
                };
            }
            self.high_water.store(command_id.0, Ordering::Release);
            let previous = active.replace(ActiveBarrier {
                command_id,
                targets,
                ready: HashSet::new(),
                video_duration: None,
                progress: progress_tx,
                cancel: cancel.clone(),
            });
            if let Some(old) = previous {
                debug!(old = ?old.command_id, new = ?command_id, "Superseding readiness barrier");
                old.cancel.cancel();
            }
        }

        let preload = broadcast::broadcast(
            players,
            &ServerMsg::SyncPreload {
                command_id,
                video_url: video_url.to_string(),
            },
        )
        .await;

        // Clients the preload never reached cannot report.
        {
            let mut active = self.active.lock().await;
            if let Some(barrier) = active.as_mut().filter(|b| b.command_id == command_id) {
                for (id, delivery) in &preload.deliveries {
                    if *delivery != Delivery::Sent {
                        barrier.targets.remove(id);
                    }
                }
                barrier.publish();
            }
        }

        let all_ready = async {
            progress_rx
                .wait_for(|p| p.ready >= p.expected)
                .await
                .is_ok()
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => ReadinessOutcome::Superseded,
            res = tokio::time::timeout(self.timeout, all_ready) => match res {
                Ok(true) => ReadinessOutcome::AllReady,
                Ok(false) => ReadinessOutcome::Superseded,
                Err(_) => ReadinessOutcome::TimedOut,
            },
        };
        let progress = *progress_rx.borrow();

        let video_duration = {
            let mut active = self.active.lock().await;
            if active.as_ref().map(|b| b.command_id) == Some(command_id) {
                active.take().and_then(|b| b.video_duration)
            } else {
                None
            }
        };

        match outcome {
            ReadinessOutcome::AllReady => {
                info!(?command_id, ready = progress.ready, "All players ready")
            }
            ReadinessOutcome::TimedOut => warn!(
                ?command_id,
                ready = progress.ready,
                expected = progress.expected,
                timeout_ms = self.timeout.as_millis() as u64,
                "Readiness timed out; proceeding with partial readiness"
            ),
            ReadinessOutcome::Superseded => {
                debug!(?command_id, ready = progress.ready, "Readiness wait superseded")
            }
        }

        ReadinessResult {
            command_id,
            ready_count: progress.ready,
            expected: progress.expected,
            outcome,
            video_duration,
            preload,
        }
    }

    /// Record a `sync_ready` report, counting it toward the armed barrier when
    /// it names the awaited command.
    pub async fn handle_client_ready(
        &self,
        id: &ClientId,
        command_id: CommandId,
        buffer_level: f64,
        duration: Option<f64>,
    ) -> ReadyDisposition {
        if !self.registry.contains(id).await {
            debug!(client_id = %id, ?command_id, "Ready report from unknown client ignored");
            return ReadyDisposition::UnknownClient;
        }

        let current = {
            let mut active = self.active.lock().await;
            match active.as_mut() {
                Some(barrier)
                    if barrier.command_id == command_id && barrier.targets.contains(id) =>
                {
                    barrier.ready.insert(id.clone());
                    if let Some(d) = duration.filter(|d| d.is_finite()) {
                        barrier.video_duration = Some(barrier.video_duration.map_or(d, |v| v.max(d)));
                    }
                    barrier.publish();
                    true
                }
                _ => false,
            }
        };

        let report = ReadyReport {
            command_id,
            received_at_ms: self.clock.now_ms(),
            current,
        };
        self.registry
            .record_ready(id, report, buffer_level, duration)
            .await;

        if current {
            debug!(client_id = %id, ?command_id, buffer_level, "Client ready");
            ReadyDisposition::Counted
        } else {
            self.stale_reports.fetch_add(1, Ordering::Relaxed);
            debug!(client_id = %id, ?command_id, "Stale ready report recorded");
            ReadyDisposition::Stale
        }
    }

    /// Stop expecting `id` in the armed barrier (it disconnected).
    pub async fn forget_client(&self, id: &ClientId) {
        let mut active = self.active.lock().await;
        if let Some(barrier) = active.as_mut() {
            if barrier.targets.remove(id) {
                barrier.ready.remove(id);
                barrier.publish();
            }
        }
    }

    /// Cancel whatever barrier is armed. Its waiter resolves as superseded.
    pub async fn cancel_active(&self) {
        if let Some(barrier) = self.active.lock().await.take() {
            debug!(command_id = ?barrier.command_id, "Readiness barrier cancelled");
            barrier.cancel.cancel();
        }
    }

    /// Retire every command up to `command_id`: an armed barrier for an
    /// older command is cancelled, and older commands can no longer arm.
    pub async fn supersede_through(&self, command_id: CommandId) {
        let mut active = self.active.lock().await;
        self.high_water.fetch_max(command_id.0, Ordering::AcqRel);
        if active.as_ref().is_some_and(|b| b.command_id <= command_id) {
            if let Some(barrier) = active.take() {
                debug!(old = ?barrier.command_id, by = ?command_id, "Readiness barrier superseded");
                barrier.cancel.cancel();
            }
        }
    }

    /// Command the armed barrier is waiting on, if any.
    pub async fn awaited_command(&self) -> Option<CommandId> {
        self.active.lock().await.as_ref().map(|b| b.command_id)
    }

    pub fn stale_report_count(&self) -> u64 {
        self.stale_reports.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::channel::ChannelConnection;
    use crate::adapters::clock::ManualClock;
    use crate::application::ports::ClientConnection;
    use crate::domain::identity::ClientRole;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn setup(
        names: &[&str],
    ) -> (Arc<ReadinessBarrier>, Arc<ClientRegistry>, Vec<UnboundedReceiver<ServerMsg>>) {
        let registry = Arc::new(ClientRegistry::new(5));
        let mut receivers = Vec::new();
        for name in names {
            let (conn, rx) = ChannelConnection::pair();
            let conn: Arc<dyn ClientConnection> = Arc::new(conn);
            registry
                .register(ClientId::new(*name), conn, name.to_string(), ClientRole::Player, 0)
                .await;
            receivers.push(rx);
        }
        let barrier = Arc::new(ReadinessBarrier::new(
            Arc::clone(&registry),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(3),
        ));
        (barrier, registry, receivers)
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_when_every_player_reports() {
        let (barrier, registry, mut rxs) = setup(&["a", "b"]).await;
        let players = registry.player_recipients().await;

        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(1), &players, "a.mp4")
                    .await
            })
        };

        for (rx, name) in rxs.iter_mut().zip(["a", "b"]) {
            let msg = rx.recv().await.unwrap();
            assert_eq!(
                msg,
                ServerMsg::SyncPreload {
                    command_id: CommandId(1),
                    video_url: "a.mp4".into()
                }
            );
            let disposition = barrier
                .handle_client_ready(&ClientId::new(name), CommandId(1), 1.0, Some(200.0))
                .await;
            assert_eq!(disposition, ReadyDisposition::Counted);
        }

        let result = waiter.await.unwrap();
        assert_eq!(result.outcome, ReadinessOutcome::AllReady);
        assert_eq!(result.ready_count, 2);
        assert_eq!(result.video_duration, Some(200.0));
        assert!(barrier.awaited_command().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_with_partial_count() {
        let (barrier, registry, mut rxs) = setup(&["a", "b"]).await;
        let players = registry.player_recipients().await;

        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(1), &players, "a.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;
        barrier
            .handle_client_ready(&ClientId::new("a"), CommandId(1), 0.5, None)
            .await;

        let result = waiter.await.unwrap();
        assert_eq!(result.outcome, ReadinessOutcome::TimedOut);
        assert_eq!(result.ready_count, 1);
        assert_eq!(result.expected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_reports_do_not_satisfy() {
        let (barrier, registry, mut rxs) = setup(&["a"]).await;
        let players = registry.player_recipients().await;
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(2), &players, "a.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;

        let disposition = barrier
            .handle_client_ready(&ClientId::new("a"), CommandId(1), 1.0, None)
            .await;
        assert_eq!(disposition, ReadyDisposition::Stale);
        assert_eq!(barrier.stale_report_count(), 1);
        let snap = registry.snapshot(&ClientId::new("a")).await.unwrap();
        assert_eq!(snap.buffer_level, Some(1.0));
        assert!(!snap.last_ready.unwrap().current);

        let result = waiter.await.unwrap();
        assert_eq!(result.outcome, ReadinessOutcome::TimedOut);
        assert_eq!(result.ready_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_barrier_supersedes_older_wait() {
        let (barrier, registry, mut rxs) = setup(&["a"]).await;
        let players = registry.player_recipients().await;
        let first = {
            let barrier = Arc::clone(&barrier);
            let players = players.clone();
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(1), &players, "a.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;
        let second = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(2), &players, "b.mp4")
                    .await
            })
        };

        let first = first.await.unwrap();
        assert_eq!(first.outcome, ReadinessOutcome::Superseded);

        let _ = rxs[0].recv().await;
        barrier
            .handle_client_ready(&ClientId::new("a"), CommandId(2), 1.0, None)
            .await;
        assert_eq!(second.await.unwrap().outcome, ReadinessOutcome::AllReady);
    }

    #[tokio::test(start_paused = true)]
    async fn older_command_cannot_displace_newer_barrier() {
        let (barrier, registry, mut rxs) = setup(&["a"]).await;
        let players = registry.player_recipients().await;
        let newer = {
            let barrier = Arc::clone(&barrier);
            let players = players.clone();
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(2), &players, "b.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;

        let older = barrier
            .await_readiness(CommandId(1), &players, "a.mp4")
            .await;
        assert_eq!(older.outcome, ReadinessOutcome::Superseded);
        assert!(older.preload.is_empty());
        assert!(rxs[0].try_recv().is_err());
        assert_eq!(barrier.awaited_command().await, Some(CommandId(2)));

        barrier
            .handle_client_ready(&ClientId::new("a"), CommandId(2), 1.0, None)
            .await;
        assert_eq!(newer.await.unwrap().outcome, ReadinessOutcome::AllReady);
    }

    #[tokio::test(start_paused = true)]
    async fn supersede_through_retires_older_commands_only() {
        let (barrier, registry, mut rxs) = setup(&["a"]).await;
        let players = registry.player_recipients().await;
        let armed = {
            let barrier = Arc::clone(&barrier);
            let players = players.clone();
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(1), &players, "a.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;

        barrier.supersede_through(CommandId(3)).await;
        assert_eq!(armed.await.unwrap().outcome, ReadinessOutcome::Superseded);
        assert!(barrier.awaited_command().await.is_none());

        let late = barrier
            .await_readiness(CommandId(2), &players, "b.mp4")
            .await;
        assert_eq!(late.outcome, ReadinessOutcome::Superseded);

        let next = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(4), &players, "c.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;
        barrier.supersede_through(CommandId(3)).await;
        assert_eq!(barrier.awaited_command().await, Some(CommandId(4)));
        barrier
            .handle_client_ready(&ClientId::new("a"), CommandId(4), 1.0, None)
            .await;
        assert_eq!(next.await.unwrap().outcome, ReadinessOutcome::AllReady);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_and_departed_players_are_not_awaited() {
        let (barrier, registry, mut rxs) = setup(&["a", "b", "c"]).await;
        // "c" never receives the preload.
        drop(rxs.pop());
        let players = registry.player_recipients().await;
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier
                    .await_readiness(CommandId(1), &players, "a.mp4")
                    .await
            })
        };
        let _ = rxs[0].recv().await;
        barrier
            .handle_client_ready(&ClientId::new("a"), CommandId(1), 1.0, None)
            .await;
        barrier.forget_client(&ClientId::new("b")).await;

        let result = waiter.await.unwrap();
        assert_eq!(result.outcome, ReadinessOutcome::AllReady);
        assert_eq!(result.expected, 1);
        assert_eq!(result.preload.skipped_count(), 1);
    }

    #[tokio::test]
    async fn unknown_client_report_is_ignored() {
        let (barrier, _registry, _rxs) = setup(&["a"]).await;
        let disposition = barrier
            .handle_client_ready(&ClientId::new("ghost"), CommandId(1), 1.0, None)
            .await;
        assert_eq!(disposition, ReadyDisposition::UnknownClient);
        assert_eq!(barrier.stale_report_count(), 0);
    }
}
