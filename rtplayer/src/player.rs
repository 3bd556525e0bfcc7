//! Player control surface

use crate::config::PlayerConfig;
use crate::event::{dispatch_events, EventSink, SinkSlot};
use crate::session::{run_session, SessionContext, SurfaceSlot};
use crate::state::{PlayState, StateMachine, Transition};
use parking_lot::{Mutex as SyncMutex, RwLock};
use rtplayer_core::{PlayUrl, PlayerError, PlayerResult, SignalingMessage, TrackKind};
use rtplayer_diagnostics::StatisticsInterval;
use rtplayer_media::{CodecRegistry, NullRenderSurface, OutputGate, RenderSurface};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Control messages queued for the origin per session
const CONTROL_QUEUE: usize = 16;

/// Consistent view of the player
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    /// Playback state
    pub state: PlayState,
    /// Numeric id of the current (or last) session
    pub session: u64,
    /// URL of the current (or last) session
    pub url: Option<String>,
    /// Output volume in 0..=1
    pub volume: f64,
    /// Whether audio output is muted
    pub audio_muted: bool,
    /// Whether video output is muted
    pub video_muted: bool,
    /// Width of the most recently decoded video frame, 0 before the first
    pub video_width: u32,
    /// Height of the most recently decoded video frame, 0 before the first
    pub video_height: u32,
    /// Statistics period in seconds, 0 when disabled
    pub statistics_interval_secs: u32,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PlayerInner {
    config: PlayerConfig,
    registry: CodecRegistry,
    runtime: Handle,
    machine: Arc<StateMachine>,
    gate: Arc<OutputGate>,
    surface: SurfaceSlot,
    sink: SinkSlot,
    statistics: StatisticsInterval,
    next_session: AtomicU64,
    /// Serializes play and stop
    session: Mutex<Option<ActiveSession>>,
    controls: SyncMutex<Option<mpsc::Sender<SignalingMessage>>>,
}

impl Drop for PlayerInner {
    fn drop(&mut self) {
        if let Some(active) = self.session.get_mut().take() {
            debug!("Player dropped, cancelling session {}", active.id);
            active.cancel.cancel();
        }
    }
}

/// Real-time stream player
///
/// Cheap to clone; clones control the same player. Every method may be
/// called from any task or thread.
///
/// # Example
/// ```rust,no_run
/// use rtplayer::{ChannelEventSink, EventSink, PlayerConfig, PlayerEvent, RtPlayer};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), rtplayer::PlayerError> {
/// let player = RtPlayer::new(PlayerConfig::default())?;
/// let (sink, mut events) = ChannelEventSink::new();
/// let sink: Arc<dyn EventSink> = sink;
/// player.set_event_sink(&sink);
///
/// player.play("webrtc://127.0.0.1:1985/live/stream", false).await?;
/// while let Some(event) = events.next().await {
///     if let PlayerEvent::FirstFrameDecoded(kind) = event {
///         println!("{} is playing", kind);
///         break;
///     }
/// }
/// player.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RtPlayer {
    inner: Arc<PlayerInner>,
}

impl std::fmt::Debug for RtPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtPlayer")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl RtPlayer {
    /// Create a player with the built-in codecs
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PlayerConfig) -> PlayerResult<Self> {
        Self::with_registry(config, CodecRegistry::with_defaults())
    }

    /// Create a player that decodes with `registry`
    pub fn with_registry(config: PlayerConfig, registry: CodecRegistry) -> PlayerResult<Self> {
        let runtime = Handle::try_current().map_err(|e| PlayerError::Initialization {
            reason: format!("no tokio runtime: {}", e),
        })?;

        let (machine, events) = StateMachine::new();
        let sink = SinkSlot::default();
        runtime.spawn(dispatch_events(events, sink.clone()));

        let surface: Arc<dyn RenderSurface> = Arc::new(NullRenderSurface);
        let inner = PlayerInner {
            gate: Arc::new(OutputGate::new(config.initial_volume)),
            statistics: StatisticsInterval::new(config.statistics_interval_secs),
            config,
            registry,
            runtime,
            machine: Arc::new(machine),
            surface: Arc::new(RwLock::new(surface)),
            sink,
            next_session: AtomicU64::new(1),
            session: Mutex::new(None),
            controls: SyncMutex::new(None),
        };
        info!("Player created ({})", rtplayer_diagnostics::version_info(inner.registry.list_codecs()));
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start playing `url`
    ///
    /// A running session is stopped first (its listeners see `Stopped`).
    /// Returns once the new session is Connecting; negotiation and every
    /// later failure are reported through the event sink. Only a malformed
    /// URL is returned as an error, and it leaves the state untouched.
    pub async fn play(&self, url: &str, support_https: bool) -> PlayerResult<()> {
        let url = PlayUrl::parse(url)?;

        let mut slot = self.inner.session.lock().await;
        if let Some(active) = slot.take() {
            self.teardown(active).await;
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        if !self.inner.machine.apply(Transition::Play {
            session: id,
            url: url.to_string(),
        }) {
            return Err(PlayerError::Initialization {
                reason: format!("session {} could not start", id),
            });
        }

        let (controls_tx, controls_rx) = mpsc::channel(CONTROL_QUEUE);
        *self.inner.controls.lock() = Some(controls_tx);

        let cancel = CancellationToken::new();
        let context = SessionContext {
            id,
            url,
            support_https,
            config: self.inner.config.clone(),
            registry: self.inner.registry.clone(),
            machine: self.inner.machine.clone(),
            gate: self.inner.gate.clone(),
            surface: self.inner.surface.clone(),
            statistics: self.inner.statistics.clone(),
            cancel: cancel.clone(),
            controls: controls_rx,
        };
        let task = self.inner.runtime.spawn(run_session(context));
        *slot = Some(ActiveSession { id, cancel, task });
        Ok(())
    }

    /// Stop the current session and wait until its workers have exited
    ///
    /// A no-op when nothing is playing. Concurrent callers all return after
    /// the single teardown finished.
    pub async fn stop(&self) {
        let mut slot = self.inner.session.lock().await;
        if let Some(active) = slot.take() {
            self.teardown(active).await;
        }
    }

    /// [`stop`](Self::stop) for callers that are not async, such as UI or FFI threads
    ///
    /// Blocks the calling thread on the player's runtime until the teardown
    /// finished.
    ///
    /// # Panics
    /// When called from inside an async task; use `stop().await` there.
    pub fn stop_blocking(&self) {
        self.inner.runtime.block_on(self.stop());
    }

    async fn teardown(&self, active: ActiveSession) {
        self.inner
            .machine
            .apply(Transition::Stop { session: active.id });
        self.inner.controls.lock().take();
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!("Session {} supervisor panicked: {}", active.id, e);
        }
        debug!("Session {} released", active.id);
    }

    /// Set the output volume; returns the value in effect after clamping
    pub fn set_volume(&self, volume: f64) -> f64 {
        self.inner.gate.set_volume(volume)
    }

    /// Output volume in 0..=1
    pub fn volume(&self) -> f64 {
        self.inner.gate.volume()
    }

    /// Mute or unmute audio output
    pub fn mute_audio(&self, muted: bool) {
        self.inner.gate.set_audio_muted(muted);
        self.signal_track(TrackKind::Audio, muted);
    }

    /// Mute or unmute video output; decoding continues while muted
    pub fn mute_video(&self, muted: bool) {
        self.inner.gate.set_video_muted(muted);
        self.signal_track(TrackKind::Video, muted);
    }

    fn signal_track(&self, kind: TrackKind, muted: bool) {
        if !self.inner.config.signal_mute_to_server {
            return;
        }
        if let Some(tx) = self.inner.controls.lock().as_ref() {
            let message = SignalingMessage::TrackControl {
                kind,
                enabled: !muted,
            };
            if tx.try_send(message).is_err() {
                debug!("Track control for {} not queued", kind);
            }
        }
    }

    /// Whether audio output is muted
    pub fn is_audio_muted(&self) -> bool {
        self.inner.gate.is_audio_muted()
    }

    /// Whether video output is muted
    pub fn is_video_muted(&self) -> bool {
        self.inner.gate.is_video_muted()
    }

    /// Emit statistics every `seconds` (0 disables); applies to the running session too
    pub fn set_statistics_interval(&self, seconds: u32) {
        self.inner.statistics.configure(seconds);
    }

    /// Statistics period in seconds
    pub fn statistics_interval(&self) -> u32 {
        self.inner.statistics.get()
    }

    /// Current playback state
    pub fn current_state(&self) -> PlayState {
        self.inner.machine.current_state()
    }

    /// Whether frames are being decoded
    pub fn is_playing(&self) -> bool {
        self.current_state() == PlayState::Playing
    }

    /// URL of the current (or last) session
    pub fn play_url(&self) -> Option<String> {
        self.inner.machine.current().url
    }

    /// Width of the most recently decoded video frame
    pub fn video_width(&self) -> u32 {
        self.inner.machine.current().video_width
    }

    /// Height of the most recently decoded video frame
    pub fn video_height(&self) -> u32 {
        self.inner.machine.current().video_height
    }

    /// Everything observable about the player at once
    pub fn snapshot(&self) -> PlayerSnapshot {
        let session = self.inner.machine.current();
        PlayerSnapshot {
            state: session.state,
            session: session.session,
            url: session.url,
            volume: self.inner.gate.volume(),
            audio_muted: self.inner.gate.is_audio_muted(),
            video_muted: self.inner.gate.is_video_muted(),
            video_width: session.video_width,
            video_height: session.video_height,
            statistics_interval_secs: self.inner.statistics.get(),
        }
    }

    /// Receive notifications in `sink`; the player keeps only a weak reference
    pub fn set_event_sink(&self, sink: &Arc<dyn EventSink>) {
        self.inner.sink.set(sink);
    }

    /// Stop sending notifications
    pub fn clear_event_sink(&self) {
        self.inner.sink.clear();
    }

    /// Send decoded frames to `surface` from now on
    pub fn set_render_surface(&self, surface: Arc<dyn RenderSurface>) {
        *self.inner.surface.write() = surface;
    }

    /// Codecs this player can decode
    pub fn codecs(&self) -> Vec<String> {
        self.inner.registry.list_codecs()
    }

    /// Library version and decodable codecs
    pub fn version_info(&self) -> String {
        rtplayer_diagnostics::version_info(self.codecs())
    }

    /// Start process-wide file logging, see [`rtplayer_diagnostics::enable_file_logging`]
    pub fn enable_file_logging() -> PlayerResult<PathBuf> {
        rtplayer_diagnostics::enable_file_logging()
    }

    /// Close the process-wide log file
    pub fn disable_file_logging() {
        rtplayer_diagnostics::disable_file_logging();
    }
}
