use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Attaching,
    Playing,
    Recovering,
    FatalRestarting,
}

/// How the feed is played back
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPath {
    /// Segment decoder with its own network/media recovery hooks
    Decoder,
    /// Plain media element playing the playlist directly
    NativeElement,
}

/// Decoder error classes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Network,
    Media,
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Supervisor start-up
    Start,
    /// Decoder parsed the playlist
    ManifestParsed,
    /// Native element loaded metadata
    MetadataLoaded,
    FrameRendered,
    DataLoaded,
    PlaybackStarted,
    Error {
        kind: ErrorKind,
        fatal: bool,
        detail: String,
    },
    /// A scheduled restart/reload delay ran out
    RestartElapsed,
}

impl StreamEvent {
    pub fn fatal(kind: ErrorKind, detail: impl Into<String>) -> Self {
        StreamEvent::Error {
            kind,
            fatal: true,
            detail: detail.into(),
        }
    }

    pub fn transient(kind: ErrorKind, detail: impl Into<String>) -> Self {
        StreamEvent::Error {
            kind,
            fatal: false,
            detail: detail.into(),
        }
    }

    fn is_playback(&self) -> bool {
        matches!(
            self,
            StreamEvent::FrameRendered | StreamEvent::DataLoaded | StreamEvent::PlaybackStarted
        )
    }
}

/// Side effects the supervisor performs for a transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamAction {
    /// Build a fresh decoder (or point the element) at the stream
    Attach,
    Play,
    /// Re-pull the playlist on the existing decoder
    ReloadSource,
    /// In-place decoder recovery, no playlist reload
    RecoverMedia,
    /// Destroy the decoder instance
    Teardown,
    ScheduleRestart(Duration),
    /// Native path: reload the element after its delay
    ReloadElement,
    HideOverlay,
}

/// Delay before a full restart; a multiplier of 1.0 keeps it fixed
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            base_delay: Duration::from_secs(3),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    fn next_after(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier.max(1.0)).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Transition table for the live feed
///
/// | state           | event                     | next            | actions                     |
/// |-----------------|---------------------------|-----------------|-----------------------------|
/// | (start)         | Start                     | Attaching       | Attach                      |
/// | Attaching/Recov | ManifestParsed            | unchanged       | Play                        |
/// | not FatalRestart| frame/data/playing        | Playing         | HideOverlay                 |
/// | any             | non-fatal error           | unchanged       | none                        |
/// | not FatalRestart| fatal Network             | Recovering      | ReloadSource                |
/// | not FatalRestart| fatal Media (budget left) | Recovering      | RecoverMedia                |
/// | not FatalRestart| fatal Other / no budget   | FatalRestarting | Teardown, ScheduleRestart   |
/// | FatalRestarting | RestartElapsed            | Attaching       | Attach                      |
///
/// The native-element path only knows Attaching and Playing: every error
/// schedules a delayed element reload and falls back to Attaching.
///
/// There is no terminal state; restarts go on for as long as the session.
pub struct StreamResilienceController {
    path: PlaybackPath,
    state: StreamState,
    policy: RestartPolicy,
    max_media_recoveries: u32,
    media_recoveries: u32,
    next_delay: Duration,
    restart_pending: bool,
    started: bool,
    restarts: u64,
}

impl StreamResilienceController {
    pub fn new(path: PlaybackPath, policy: RestartPolicy, max_media_recoveries: u32) -> Self {
        StreamResilienceController {
            path,
            state: StreamState::Attaching,
            policy,
            max_media_recoveries,
            media_recoveries: 0,
            next_delay: policy.base_delay,
            restart_pending: false,
            started: false,
            restarts: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn path(&self) -> PlaybackPath {
        self.path
    }

    /// Full teardowns (decoder path) or scheduled reloads (native path) so far
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn handle(&mut self, event: StreamEvent) -> Vec<StreamAction> {
        let before = self.state;
        let actions = match self.path {
            PlaybackPath::Decoder => self.handle_decoder(event),
            PlaybackPath::NativeElement => self.handle_native(event),
        };
        if before != self.state {
            log::info!("[STREAM] {:?} -> {:?}", before, self.state);
        }
        actions
    }

    fn handle_decoder(&mut self, event: StreamEvent) -> Vec<StreamAction> {
        use StreamAction::*;

        if event.is_playback() {
            if self.state == StreamState::FatalRestarting {
                return vec![];
            }
            self.mark_playing();
            return vec![HideOverlay];
        }

        match event {
            StreamEvent::Start if !self.started => {
                self.started = true;
                self.state = StreamState::Attaching;
                vec![Attach]
            }
            StreamEvent::ManifestParsed | StreamEvent::MetadataLoaded
                if matches!(self.state, StreamState::Attaching | StreamState::Recovering) =>
            {
                vec![Play]
            }
            StreamEvent::Error { fatal: false, .. } => vec![],
            StreamEvent::Error { .. } if self.state == StreamState::FatalRestarting => vec![],
            StreamEvent::Error { kind, detail, .. } => {
                log::warn!("[STREAM] Fatal {:?} error: {}", kind, detail);
                match kind {
                    ErrorKind::Network => {
                        self.state = StreamState::Recovering;
                        vec![ReloadSource]
                    }
                    ErrorKind::Media if self.media_recoveries < self.max_media_recoveries => {
                        self.media_recoveries += 1;
                        self.state = StreamState::Recovering;
                        vec![RecoverMedia]
                    }
                    ErrorKind::Media => {
                        log::warn!(
                            "[STREAM] Media recovery exhausted after {} attempt(s)",
                            self.media_recoveries
                        );
                        self.teardown()
                    }
                    ErrorKind::Other => self.teardown(),
                }
            }
            StreamEvent::RestartElapsed if self.state == StreamState::FatalRestarting => {
                self.restart_pending = false;
                self.media_recoveries = 0;
                self.state = StreamState::Attaching;
                vec![Attach]
            }
            _ => vec![],
        }
    }

    fn handle_native(&mut self, event: StreamEvent) -> Vec<StreamAction> {
        use StreamAction::*;

        if event.is_playback() {
            self.mark_playing();
            return vec![HideOverlay];
        }

        match event {
            StreamEvent::Start if !self.started => {
                self.started = true;
                vec![Attach]
            }
            StreamEvent::MetadataLoaded | StreamEvent::ManifestParsed => vec![Play],
            StreamEvent::Error { detail, .. } => {
                self.state = StreamState::Attaching;
                if self.restart_pending {
                    return vec![];
                }
                log::warn!("[STREAM] Element error, reloading: {}", detail);
                self.restart_pending = true;
                self.restarts += 1;
                vec![ScheduleRestart(self.policy.base_delay)]
            }
            StreamEvent::RestartElapsed if self.restart_pending => {
                self.restart_pending = false;
                vec![ReloadElement]
            }
            _ => vec![],
        }
    }

    fn mark_playing(&mut self) {
        self.state = StreamState::Playing;
        self.media_recoveries = 0;
        self.next_delay = self.policy.base_delay;
    }

    fn teardown(&mut self) -> Vec<StreamAction> {
        let delay = self.next_delay;
        self.next_delay = self.policy.next_after(delay);
        self.state = StreamState::FatalRestarting;
        self.restart_pending = true;
        self.restarts += 1;
        log::warn!(
            "[STREAM] Tearing down decoder, restart #{} in {:.1}s",
            self.restarts,
            delay.as_secs_f64()
        );
        vec![StreamAction::Teardown, StreamAction::ScheduleRestart(delay)]
    }
}
