//! Player tests: control surface, event contract and end-to-end playback
//! against the loopback origin

use rtplayer::*;
use rtplayer_signaling::{OriginConfig, OriginHandle, StreamOrigin, SyntheticStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Surface that counts what reaches it
#[derive(Debug, Default)]
struct CountingSurface {
    audio: AtomicU64,
    video: AtomicU64,
    last_width: AtomicU64,
}

impl RenderSurface for CountingSurface {
    fn render_video(&self, frame: &VideoFrame) {
        self.video.fetch_add(1, Ordering::SeqCst);
        self.last_width.store(frame.width as u64, Ordering::SeqCst);
    }

    fn render_audio(&self, _frame: &AudioFrame) {
        self.audio.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    player: RtPlayer,
    events: EventStream,
    seen: Vec<PlayerEvent>,
    // the player only holds the sink weakly
    _sink: Arc<dyn EventSink>,
}

impl Harness {
    fn new(config: PlayerConfig) -> Self {
        Self::with_player(RtPlayer::new(config).unwrap())
    }

    fn with_player(player: RtPlayer) -> Self {
        let (sink, events) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = sink;
        player.set_event_sink(&sink);
        Self {
            player,
            events,
            seen: Vec::new(),
            _sink: sink,
        }
    }

    /// Wait for an event matching `pred`; every event received is kept in `seen`
    async fn wait_for(&mut self, pred: impl Fn(&PlayerEvent) -> bool) -> bool {
        let result = timeout(EVENT_WAIT, async {
            while let Some(event) = self.events.next().await {
                let hit = pred(&event);
                self.seen.push(event);
                if hit {
                    return true;
                }
            }
            false
        })
        .await;
        result.unwrap_or(false)
    }

    /// Collect whatever arrives within `window`
    async fn settle(&mut self, window: Duration) {
        tokio::time::sleep(window).await;
        self.seen.extend(self.events.drain());
    }

    fn count(&self, pred: impl Fn(&PlayerEvent) -> bool) -> usize {
        self.seen.iter().filter(|e| pred(e)).count()
    }

    fn position(&self, wanted: &PlayerEvent) -> Option<usize> {
        self.seen.iter().position(|e| e == wanted)
    }
}

async fn start_origin(path: &str, stream: SyntheticStream) -> OriginHandle {
    let origin = StreamOrigin::bind(OriginConfig::default()).await.unwrap();
    origin.publish(path, stream);
    origin.spawn()
}

async fn unused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn is_error(event: &PlayerEvent) -> bool {
    matches!(event, PlayerEvent::Error { .. })
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Control surface without a session
// ============================================================================

#[tokio::test]
async fn test_new_player_is_idle() {
    let player = RtPlayer::new(PlayerConfig::default()).unwrap();
    let snapshot = player.snapshot();

    assert_eq!(snapshot.state, PlayState::Idle);
    assert!(!player.is_playing());
    assert_eq!(player.play_url(), None);
    assert_eq!(player.video_width(), 0);
    assert_eq!(player.video_height(), 0);
    assert_eq!(snapshot.volume, 1.0);
    assert_eq!(player.statistics_interval(), 0);
}

#[test]
fn test_new_requires_a_runtime() {
    let error = RtPlayer::new(PlayerConfig::default()).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Resource);
}

#[tokio::test]
async fn test_set_volume_is_clamped_in_snapshot() {
    let player = RtPlayer::new(PlayerConfig::default()).unwrap();

    for (requested, expected) in [(-0.5, 0.0), (0.0, 0.0), (0.3, 0.3), (1.0, 1.0), (7.0, 1.0)] {
        assert_eq!(player.set_volume(requested), expected);
        assert_eq!(player.snapshot().volume, expected);
    }

    player.set_volume(0.4);
    assert_eq!(player.set_volume(f64::NAN), 0.4);
    assert_eq!(player.volume(), 0.4);
}

#[tokio::test]
async fn test_initial_volume_and_interval_from_config() {
    let player = RtPlayer::new(PlayerConfig {
        initial_volume: 2.5,
        statistics_interval_secs: 3,
        ..PlayerConfig::default()
    })
    .unwrap();

    assert_eq!(player.volume(), 1.0);
    assert_eq!(player.statistics_interval(), 3);
    player.set_statistics_interval(0);
    assert_eq!(player.snapshot().statistics_interval_secs, 0);
}

#[tokio::test]
async fn test_mute_flags() {
    let player = RtPlayer::new(PlayerConfig::default()).unwrap();
    player.mute_audio(true);
    player.mute_video(true);
    assert!(player.is_audio_muted());
    assert!(player.snapshot().video_muted);

    player.mute_video(false);
    assert!(!player.is_video_muted());
    assert!(player.is_audio_muted());
}

#[tokio::test]
async fn test_stop_from_idle_is_a_noop() {
    let mut harness = Harness::new(PlayerConfig::default());

    harness.player.stop().await;
    harness.player.stop().await;
    harness.settle(Duration::from_millis(100)).await;

    assert_eq!(harness.player.current_state(), PlayState::Idle);
    assert!(harness.seen.is_empty());
}

#[tokio::test]
async fn test_malformed_url_is_rejected_synchronously() {
    let mut harness = Harness::new(PlayerConfig::default());

    let error = assert_err!(harness.player.play("http://example.com/live", false).await);
    assert!(matches!(error, PlayerError::UnsupportedScheme { .. }));
    harness.settle(Duration::from_millis(50)).await;

    assert_eq!(harness.player.current_state(), PlayState::Idle);
    assert!(harness.seen.is_empty());
}

#[tokio::test]
async fn test_version_info_lists_codecs() {
    let player = RtPlayer::new(PlayerConfig::default()).unwrap();
    let version = player.version_info();
    assert!(version.starts_with("rtplayer "));
    assert!(version.contains("l16"));
    assert!(version.contains("x-raw-i420"));
}

// ============================================================================
// Failure reporting
// ============================================================================

#[tokio::test]
async fn test_unreachable_url_reports_one_connection_error() {
    let mut harness = Harness::new(PlayerConfig::default());
    let url = format!("webrtc://127.0.0.1:{}/live/nobody", unused_port().await);

    assert_ok!(harness.player.play(&url, false).await);
    assert!(harness.wait_for(is_error).await);
    harness.settle(Duration::from_millis(200)).await;

    assert_eq!(harness.count(is_error), 1);
    assert!(matches!(
        harness.seen.iter().find(|e| is_error(e)),
        Some(PlayerEvent::Error {
            kind: ErrorKind::Connection,
            ..
        })
    ));
    assert_eq!(harness.seen[0], PlayerEvent::StateChanged(PlayState::Connecting));
    assert!(harness.position(&PlayerEvent::StateChanged(PlayState::Error)).is_none());
    assert_eq!(harness.player.current_state(), PlayState::Error);
    assert_eq!(harness.player.play_url(), Some(url));
}

#[tokio::test]
async fn test_unknown_stream_is_a_protocol_error() {
    let origin = start_origin("live/real", SyntheticStream::audio_only()).await;
    let mut harness = Harness::new(PlayerConfig::default());

    assert_ok!(harness.player.play(&origin.play_url("live/imaginary"), false).await);
    assert!(harness.wait_for(is_error).await);

    assert!(matches!(
        harness.seen.last(),
        Some(PlayerEvent::Error {
            kind: ErrorKind::Protocol,
            ..
        })
    ));
    assert_eq!(harness.player.current_state(), PlayState::Error);
}

#[tokio::test]
async fn test_missing_decoder_is_a_protocol_error() {
    let origin = start_origin("live/av", SyntheticStream::audio_video()).await;
    let mut registry = CodecRegistry::new();
    registry.register(codec_names::L16, |desc| {
        Ok(Box::new(rtplayer_media::L16Decoder::new(desc.clock_rate, 1)?))
    });
    let player = RtPlayer::with_registry(PlayerConfig::default(), registry).unwrap();
    let mut harness = Harness::with_player(player);

    assert_ok!(harness.player.play(&origin.play_url("live/av"), false).await);
    assert!(harness.wait_for(is_error).await);
    assert!(matches!(
        harness.seen.last(),
        Some(PlayerEvent::Error {
            kind: ErrorKind::Protocol,
            ..
        })
    ));
}

#[tokio::test]
async fn test_end_of_stream_is_a_connection_error() {
    let stream = SyntheticStream::audio_only().with_duration(Duration::from_millis(600));
    let origin = start_origin("live/short", stream).await;
    let mut harness = Harness::new(PlayerConfig::default());

    assert_ok!(harness.player.play(&origin.play_url("live/short"), false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Playing)).await);
    assert!(harness.wait_for(is_error).await);

    assert!(matches!(
        harness.seen.last(),
        Some(PlayerEvent::Error {
            kind: ErrorKind::Connection,
            ..
        })
    ));
    assert_eq!(harness.player.current_state(), PlayState::Error);
    assert!(eventually(|| origin.active_sessions() == 0).await);

    // stop after an error changes nothing
    harness.player.stop().await;
    harness.settle(Duration::from_millis(50)).await;
    assert_eq!(harness.player.current_state(), PlayState::Error);
    assert_eq!(harness.count(|e| matches!(e, PlayerEvent::StateChanged(_))), 2);
}

// ============================================================================
// Playback
// ============================================================================

#[tokio::test]
async fn test_plays_audio_and_video() {
    let origin = start_origin("live/av", SyntheticStream::audio_video()).await;
    let mut harness = Harness::new(PlayerConfig::default());
    let surface = Arc::new(CountingSurface::default());
    harness.player.set_render_surface(surface.clone());

    assert_ok!(harness.player.play(&origin.play_url("live/av"), false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::FirstFrameDecoded(TrackKind::Video)).await);
    assert!(eventually(|| harness.player.is_playing()).await);

    let received = harness
        .position(&PlayerEvent::TrackReceived(TrackKind::Video))
        .expect("video track received");
    let decoded = harness
        .position(&PlayerEvent::FirstFrameDecoded(TrackKind::Video))
        .unwrap();
    assert!(received < decoded);
    assert_eq!(harness.player.video_width(), 160);
    assert_eq!(harness.player.video_height(), 120);
    assert!(eventually(|| surface.audio.load(Ordering::SeqCst) > 0).await);
    assert_eq!(surface.last_width.load(Ordering::SeqCst), 160);

    harness.player.stop().await;
    assert_eq!(harness.player.current_state(), PlayState::Stopped);
    harness.settle(Duration::from_millis(100)).await;
    assert_eq!(harness.count(|e| *e == PlayerEvent::TrackReceived(TrackKind::Video)), 1);
    assert_eq!(harness.count(|e| *e == PlayerEvent::FirstFrameDecoded(TrackKind::Video)), 1);
    assert_eq!(harness.seen.last(), Some(&PlayerEvent::StateChanged(PlayState::Stopped)));
    assert_eq!(harness.player.video_width(), 160);
    assert!(eventually(|| origin.active_sessions() == 0).await);
}

#[tokio::test]
async fn test_late_announced_track_plays() {
    let stream = SyntheticStream::audio_video().with_late_video();
    let origin = start_origin("live/late", stream).await;
    let mut harness = Harness::new(PlayerConfig::default());

    assert_ok!(harness.player.play(&origin.play_url("live/late"), false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::FirstFrameDecoded(TrackKind::Video)).await);
    assert_eq!(harness.count(|e| *e == PlayerEvent::TrackReceived(TrackKind::Video)), 1);

    harness.player.stop().await;
}

#[tokio::test]
async fn test_statistics_follow_the_interval() {
    let origin = start_origin("live/av", SyntheticStream::audio_video()).await;
    let mut harness = Harness::new(PlayerConfig::default());

    assert_ok!(harness.player.play(&origin.play_url("live/av"), false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Playing)).await);
    harness.settle(Duration::from_millis(1500)).await;
    assert_eq!(harness.count(|e| matches!(e, PlayerEvent::Statistics(_))), 0);

    harness.player.set_statistics_interval(1);
    assert!(harness.wait_for(|e| matches!(e, PlayerEvent::Statistics(_))).await);
    let snapshot = harness
        .seen
        .iter()
        .find_map(|e| match e {
            PlayerEvent::Statistics(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
    assert!(snapshot.packets_received > 0);
    assert!(snapshot.bitrate_kbps > 0.0);
    assert_eq!(snapshot.video_width, 160);

    harness.player.stop().await;
}

#[tokio::test]
async fn test_mute_suppresses_output_but_keeps_decoding() {
    let origin = start_origin("live/av", SyntheticStream::audio_video()).await;
    let harness = Harness::new(PlayerConfig {
        signal_mute_to_server: true,
        ..PlayerConfig::default()
    });
    let surface = Arc::new(CountingSurface::default());
    harness.player.set_render_surface(surface.clone());

    assert_ok!(harness.player.play(&origin.play_url("live/av"), false).await);
    assert!(eventually(|| surface.video.load(Ordering::SeqCst) > 0).await);

    harness.player.mute_video(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frozen = surface.video.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(surface.video.load(Ordering::SeqCst), frozen);
    assert!(harness.player.is_playing());

    // the origin was told the video is not wanted
    assert!(
        eventually(|| origin
            .sessions()
            .first()
            .is_some_and(|s| s.disabled_tracks.contains(&TrackKind::Video)))
        .await
    );

    harness.player.stop().await;
}

#[tokio::test]
async fn test_play_while_playing_restarts() {
    let origin = start_origin("live/audio", SyntheticStream::audio_only()).await;
    let mut harness = Harness::new(PlayerConfig::default());
    let url = origin.play_url("live/audio");

    assert_ok!(harness.player.play(&url, false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Playing)).await);
    assert_ok!(harness.player.play(&url, false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Playing)).await);

    let states: Vec<PlayState> = harness
        .seen
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            PlayState::Connecting,
            PlayState::Playing,
            PlayState::Stopped,
            PlayState::Connecting,
            PlayState::Playing,
        ]
    );
    assert_eq!(harness.player.snapshot().session, 2);

    harness.player.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stop_tears_down_once() {
    let origin = start_origin("live/av", SyntheticStream::audio_video()).await;
    let mut harness = Harness::new(PlayerConfig::default());

    assert_ok!(harness.player.play(&origin.play_url("live/av"), false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Playing)).await);

    let first = {
        let player = harness.player.clone();
        tokio::spawn(async move { player.stop().await })
    };
    let second = {
        let player = harness.player.clone();
        tokio::spawn(async move { player.stop().await })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(harness.player.current_state(), PlayState::Stopped);
    harness.settle(Duration::from_millis(200)).await;
    assert_eq!(harness.count(|e| *e == PlayerEvent::StateChanged(PlayState::Stopped)), 1);
    assert_eq!(harness.count(is_error), 0);

    // no worker is left sending statistics or frames for the old session
    harness.player.set_statistics_interval(1);
    harness.settle(Duration::from_millis(1500)).await;
    assert_eq!(harness.count(|e| matches!(e, PlayerEvent::Statistics(_))), 0);
    assert!(eventually(|| origin.active_sessions() == 0).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_blocking_from_a_plain_thread() {
    let origin = start_origin("live/audio", SyntheticStream::audio_only()).await;
    let mut harness = Harness::new(PlayerConfig::default());

    assert_ok!(harness.player.play(&origin.play_url("live/audio"), false).await);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Playing)).await);

    let player = harness.player.clone();
    let stopper = std::thread::spawn(move || {
        player.stop_blocking();
        player.current_state()
    });
    let state = tokio::task::spawn_blocking(move || stopper.join().unwrap())
        .await
        .unwrap();

    assert_eq!(state, PlayState::Stopped);
    assert!(harness.wait_for(|e| *e == PlayerEvent::StateChanged(PlayState::Stopped)).await);
    assert!(eventually(|| origin.active_sessions() == 0).await);
}

#[tokio::test]
async fn test_dropped_sink_is_tolerated() {
    let origin = start_origin("live/audio", SyntheticStream::audio_only()).await;
    let player = RtPlayer::new(PlayerConfig::default()).unwrap();
    {
        let (sink, _events) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = sink;
        player.set_event_sink(&sink);
    }

    player.play(&origin.play_url("live/audio"), false).await.unwrap();
    assert!(eventually(|| player.is_playing()).await);
    player.stop().await;
    assert_eq!(player.current_state(), PlayState::Stopped);
}
