//! Playback state machine
//!
//! All state writes go through [`StateMachine`]. A transition is validated
//! and committed inside one `watch` update, and the notifications it causes
//! are queued in the same critical section, so sinks observe events in
//! commit order and never see events of a session that already ended.

use crate::event::PlayerEvent;
use rtplayer_core::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Playback state of a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayState {
    /// Nothing has been played yet
    Idle,
    /// A session is negotiating or waiting for its first decoded frame
    Connecting,
    /// Frames are being decoded
    Playing,
    /// The last session was stopped by the caller
    Stopped,
    /// The last session ended with an unrecoverable error
    Error,
}

impl PlayState {
    /// Whether a session is running
    pub fn is_active(&self) -> bool {
        matches!(self, PlayState::Connecting | PlayState::Playing)
    }

    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Idle => "idle",
            PlayState::Connecting => "connecting",
            PlayState::Playing => "playing",
            PlayState::Stopped => "stopped",
            PlayState::Error => "error",
        }
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-scoped values committed together with the state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Current state
    pub state: PlayState,
    /// Numeric id of the current (or last) session, 0 before the first play
    pub session: u64,
    /// URL of the current (or last) session
    pub url: Option<String>,
    /// Width of the most recently decoded video frame
    pub video_width: u32,
    /// Height of the most recently decoded video frame
    pub video_height: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            state: PlayState::Idle,
            session: 0,
            url: None,
            video_width: 0,
            video_height: 0,
        }
    }
}

/// Inputs of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A new session starts
    Play {
        /// Id of the new session; must be larger than any previous one
        session: u64,
        /// URL being played
        url: String,
    },
    /// The session decoded its first frame
    FirstFrameDecoded {
        /// Session the frame belongs to
        session: u64,
    },
    /// The caller stopped the session
    Stop {
        /// Session being stopped
        session: u64,
    },
    /// The session failed
    Fail {
        /// Failing session
        session: u64,
        /// Error category
        kind: ErrorKind,
        /// Description passed to the sink
        message: String,
    },
}

impl Transition {
    fn session(&self) -> u64 {
        match self {
            Transition::Play { session, .. }
            | Transition::FirstFrameDecoded { session }
            | Transition::Stop { session }
            | Transition::Fail { session, .. } => *session,
        }
    }
}

/// Single writer of the playback state
#[derive(Debug)]
pub struct StateMachine {
    state: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl StateMachine {
    /// Create an idle state machine and the queue its notifications go to
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (state, _) = watch::channel(SessionState::default());
        let (events, rx) = mpsc::unbounded_channel();
        (Self { state, events }, rx)
    }

    /// Validate and commit a transition; returns whether it was applied
    ///
    /// Transitions for a session other than the current one, and transitions
    /// the table does not allow, are ignored.
    pub fn apply(&self, transition: Transition) -> bool {
        let events = &self.events;
        let mut committed = None;
        self.state.send_if_modified(|current| {
            let Some(next) = next_state(current, &transition) else {
                return false;
            };

            let from = current.state;
            current.state = next;
            let event = match &transition {
                Transition::Play { session, url } => {
                    current.session = *session;
                    current.url = Some(url.clone());
                    current.video_width = 0;
                    current.video_height = 0;
                    PlayerEvent::StateChanged(next)
                }
                Transition::Fail { kind, message, .. } => PlayerEvent::Error {
                    kind: *kind,
                    message: message.clone(),
                },
                Transition::FirstFrameDecoded { .. } | Transition::Stop { .. } => {
                    PlayerEvent::StateChanged(next)
                }
            };
            let _ = events.send(event);
            committed = Some((from, next));
            true
        });

        match committed {
            Some((from, to)) => {
                info!("Session {}: {} -> {}", transition.session(), from, to);
                true
            }
            None => {
                debug!("Ignoring {:?} in state {}", transition, self.current_state());
                false
            }
        }
    }

    /// Queue a notification if `session` is still the active session
    pub fn emit(&self, session: u64, event: PlayerEvent) -> bool {
        let events = &self.events;
        let mut sent = false;
        self.state.send_if_modified(|current| {
            if current.session == session && current.state.is_active() {
                sent = events.send(event).is_ok();
            }
            false
        });
        sent
    }

    /// Record the resolution of a decoded video frame
    pub fn record_video_size(&self, session: u64, width: u32, height: u32) {
        self.state.send_if_modified(|current| {
            if current.session != session
                || !current.state.is_active()
                || (current.video_width == width && current.video_height == height)
            {
                return false;
            }
            debug!("Video size {}x{}", width, height);
            current.video_width = width;
            current.video_height = height;
            true
        });
    }

    /// Current state
    pub fn current_state(&self) -> PlayState {
        self.state.borrow().state
    }

    /// Consistent copy of the session-scoped values
    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch every committed change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

fn next_state(current: &SessionState, transition: &Transition) -> Option<PlayState> {
    let same_session = transition.session() == current.session;
    match (current.state, transition) {
        (PlayState::Idle | PlayState::Stopped | PlayState::Error, Transition::Play { session, .. })
            if *session > current.session =>
        {
            Some(PlayState::Connecting)
        }
        (PlayState::Connecting, Transition::FirstFrameDecoded { .. }) if same_session => {
            Some(PlayState::Playing)
        }
        (PlayState::Connecting | PlayState::Playing, Transition::Stop { .. }) if same_session => {
            Some(PlayState::Stopped)
        }
        (PlayState::Connecting | PlayState::Playing, Transition::Fail { .. }) if same_session => {
            Some(PlayState::Error)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(session: u64) -> Transition {
        Transition::Play {
            session,
            url: format!("webrtc://origin/live/{}", session),
        }
    }

    fn fail(session: u64) -> Transition {
        Transition::Fail {
            session,
            kind: ErrorKind::Connection,
            message: "refused".to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_happy_path() {
        let (machine, mut rx) = StateMachine::new();
        assert!(machine.apply(play(1)));
        assert!(machine.apply(Transition::FirstFrameDecoded { session: 1 }));
        assert!(!machine.apply(Transition::FirstFrameDecoded { session: 1 }));
        assert!(machine.apply(Transition::Stop { session: 1 }));

        assert_eq!(
            drain(&mut rx),
            vec![
                PlayerEvent::StateChanged(PlayState::Connecting),
                PlayerEvent::StateChanged(PlayState::Playing),
                PlayerEvent::StateChanged(PlayState::Stopped),
            ]
        );
        assert_eq!(machine.current().url.as_deref(), Some("webrtc://origin/live/1"));
    }

    #[test]
    fn test_error_only_reaches_the_error_channel() {
        let (machine, mut rx) = StateMachine::new();
        machine.apply(play(1));
        drain(&mut rx);

        assert!(machine.apply(fail(1)));
        assert!(!machine.apply(fail(1)));
        assert_eq!(machine.current_state(), PlayState::Error);
        assert_eq!(
            drain(&mut rx),
            vec![PlayerEvent::Error {
                kind: ErrorKind::Connection,
                message: "refused".to_string()
            }]
        );
    }

    #[test]
    fn test_stop_outside_a_session_is_ignored() {
        let (machine, mut rx) = StateMachine::new();
        assert!(!machine.apply(Transition::Stop { session: 0 }));
        assert!(!machine.apply(Transition::Stop { session: 1 }));
        assert_eq!(machine.current_state(), PlayState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_stale_session_is_ignored() {
        let (machine, mut rx) = StateMachine::new();
        machine.apply(play(1));
        machine.apply(Transition::Stop { session: 1 });
        machine.apply(play(2));
        drain(&mut rx);

        assert!(!machine.apply(fail(1)));
        assert!(!machine.apply(Transition::FirstFrameDecoded { session: 1 }));
        assert!(!machine.emit(1, PlayerEvent::TrackReceived(rtplayer_core::TrackKind::Audio)));
        assert!(machine.emit(2, PlayerEvent::TrackReceived(rtplayer_core::TrackKind::Audio)));
        assert_eq!(machine.current_state(), PlayState::Connecting);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_play_requires_a_newer_session_and_no_active_one() {
        let (machine, _rx) = StateMachine::new();
        machine.apply(play(3));
        assert!(!machine.apply(play(4)), "active session must be stopped first");
        machine.apply(Transition::Stop { session: 3 });
        assert!(!machine.apply(play(2)));
        assert!(machine.apply(play(4)));
    }

    #[test]
    fn test_video_size_resets_on_play() {
        let (machine, _rx) = StateMachine::new();
        machine.apply(play(1));
        machine.record_video_size(1, 640, 360);
        machine.record_video_size(7, 1, 1);
        assert_eq!(machine.current().video_width, 640);

        machine.apply(Transition::Stop { session: 1 });
        assert_eq!(machine.current().video_height, 360);
        machine.apply(play(2));
        assert_eq!(machine.current().video_width, 0);
    }

    #[test]
    fn test_watchers_see_commits() {
        let (machine, _rx) = StateMachine::new();
        let mut watcher = machine.subscribe();
        machine.apply(play(1));
        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow_and_update().state, PlayState::Connecting);

        machine.emit(1, PlayerEvent::TrackReceived(rtplayer_core::TrackKind::Video));
        assert!(!watcher.has_changed().unwrap());
    }
}
