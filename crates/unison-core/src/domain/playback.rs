//! Authoritative playback state and scheduled command descriptors.

use serde::Serialize;

use super::identity::CommandId;

/// The media currently loaded on the displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentVideo {
    pub url: String,
    /// Learned from client readiness reports; unknown until the first one.
    pub duration_seconds: Option<f64>,
}

/// `idle → scheduling → playing → paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    Idle,
    Scheduling,
    Playing,
    Paused,
}

/// Maps server wall-clock time onto a video position.
///
/// Anchored at the instant playback was scheduled to begin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub scheduled_at_ms: i64,
    pub video_time: f64,
}

impl Timeline {
    /// Expected position (seconds) at server time `at_ms`.
    ///
    /// Before the anchor the position holds at `video_time`.
    pub fn position_at(&self, at_ms: i64) -> f64 {
        let elapsed_ms = (at_ms - self.scheduled_at_ms).max(0);
        self.video_time + elapsed_ms as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Preload,
    Play,
    Pause,
}

/// A command issued to every player for execution at `scheduled_at_ms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledCommand {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub scheduled_at_ms: i64,
    /// Target playback offset at `scheduled_at_ms` (play only).
    pub video_position_seconds: Option<f64>,
}

// ---------------------------------------------------------------------------
// SyncState
// ---------------------------------------------------------------------------

/// Process-wide playback state, owned by one engine instance.
///
/// Invariant: [`SyncState::is_playing`] implies `current_video` is set. Both
/// are only ever written together by [`SyncState::start_playing`].
#[derive(Debug, Clone)]
pub struct SyncState {
    current_video: Option<CurrentVideo>,
    phase: PlaybackPhase,
    active_command_id: Option<CommandId>,
    timeline: Option<Timeline>,
    /// Position frozen at the last pause, used by resume.
    paused_position: Option<f64>,
    /// Phase a pending play interrupted; the old timeline still runs under it.
    before_scheduling: PlaybackPhase,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            current_video: None,
            phase: PlaybackPhase::Idle,
            active_command_id: None,
            timeline: None,
            paused_position: None,
            before_scheduling: PlaybackPhase::Idle,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.phase == PlaybackPhase::Playing
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    pub fn current_video(&self) -> Option<&CurrentVideo> {
        self.current_video.as_ref()
    }

    pub fn active_command_id(&self) -> Option<CommandId> {
        self.active_command_id
    }

    pub fn timeline(&self) -> Option<Timeline> {
        self.timeline
    }

    pub fn is_active(&self, command_id: CommandId) -> bool {
        self.active_command_id == Some(command_id)
    }

    /// Claim the active command slot. A play that replaces another pending
    /// play keeps the phase the first one interrupted.
    pub fn begin_scheduling(&mut self, command_id: CommandId) {
        if self.phase != PlaybackPhase::Scheduling {
            self.before_scheduling = self.phase;
        }
        self.phase = PlaybackPhase::Scheduling;
        self.active_command_id = Some(command_id);
    }

    /// Put back the interrupted phase if `command_id` still owns the state.
    pub fn abandon_scheduling(&mut self, command_id: CommandId) {
        if self.is_active(command_id) && self.phase == PlaybackPhase::Scheduling {
            self.phase = self.before_scheduling;
        }
    }

    pub fn start_playing(
        &mut self,
        command_id: CommandId,
        url: &str,
        video_time: f64,
        scheduled_at_ms: i64,
        reported_duration: Option<f64>,
    ) {
        let duration_seconds = reported_duration.or_else(|| {
            self.current_video
                .as_ref()
                .filter(|v| v.url == url)
                .and_then(|v| v.duration_seconds)
        });
        self.current_video = Some(CurrentVideo {
            url: url.to_string(),
            duration_seconds,
        });
        self.timeline = Some(Timeline {
            scheduled_at_ms,
            video_time,
        });
        self.paused_position = None;
        self.active_command_id = Some(command_id);
        self.phase = PlaybackPhase::Playing;
    }

    /// Stop the timeline at `at_ms`.
    ///
    /// A pause that lands while a new play is still preloading freezes the
    /// timeline that was playing before it.
    pub fn pause(&mut self, command_id: CommandId, at_ms: i64) {
        let timeline_running = match self.phase {
            PlaybackPhase::Playing => true,
            PlaybackPhase::Scheduling => self.before_scheduling == PlaybackPhase::Playing,
            PlaybackPhase::Idle | PlaybackPhase::Paused => false,
        };
        if timeline_running {
            self.paused_position = self.timeline.map(|t| t.position_at(at_ms));
        }
        self.active_command_id = Some(command_id);
        self.phase = if self.current_video.is_some() {
            PlaybackPhase::Paused
        } else {
            PlaybackPhase::Idle
        };
    }

    /// Where a resume should pick up: the current url and the paused position.
    pub fn resume_point(&self) -> Option<(String, f64)> {
        if self.phase != PlaybackPhase::Paused {
            return None;
        }
        let video = self.current_video.as_ref()?;
        Some((video.url.clone(), self.paused_position.unwrap_or(0.0)))
    }

    /// Record a duration reported for the active command's media.
    pub fn learn_duration(&mut self, command_id: CommandId, duration_seconds: f64) {
        if !self.is_active(command_id)
            || self.phase == PlaybackPhase::Scheduling
            || !duration_seconds.is_finite()
        {
            return;
        }
        if let Some(video) = self.current_video.as_mut() {
            video.duration_seconds = Some(duration_seconds);
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}
