//! Tests for the jitter and sync buffer

use bytes::Bytes;
use rtplayer_core::{PlayerError, StreamCounters, TrackKind};
use rtplayer_media::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn frame(kind: TrackKind, pts_ms: u64, arrival: Instant) -> EncodedFrame {
    EncodedFrame {
        kind,
        codec: "L16".to_string(),
        pts: Duration::from_millis(pts_ms),
        rtp_timestamp: pts_ms as u32,
        payload: Bytes::from_static(&[0u8; 16]),
        is_keyframe: true,
        arrival,
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[tokio::test]
async fn test_steady_stream_releases_after_base_delay() {
    let mut buffer = SyncBuffer::new(JitterConfig::default());
    let t0 = Instant::now();

    let outcome = buffer.push(frame(TrackKind::Audio, 0, t0), t0).unwrap();
    assert_eq!(outcome, PushOutcome::Queued);
    assert_eq!(buffer.next_deadline(), Some(t0 + ms(60)));

    assert!(buffer.pop_ready(t0 + ms(59)).is_empty());
    let ready = buffer.pop_ready(t0 + ms(60));
    assert_eq!(ready.len(), 1);
    assert!(buffer.is_empty());
    assert_eq!(buffer.next_deadline(), None);
}

#[tokio::test]
async fn test_frames_leave_in_timestamp_order_across_tracks() {
    let mut buffer = SyncBuffer::new(JitterConfig::default());
    let t0 = Instant::now();

    buffer.push(frame(TrackKind::Video, 40, t0 + ms(40)), t0 + ms(40)).unwrap();
    buffer.push(frame(TrackKind::Audio, 0, t0), t0 + ms(40)).unwrap();
    buffer.push(frame(TrackKind::Audio, 20, t0 + ms(20)), t0 + ms(40)).unwrap();

    let ready = buffer.pop_ready(t0 + ms(500));
    let order: Vec<Duration> = ready.iter().map(|f| f.pts).collect();
    assert_eq!(order, vec![ms(0), ms(20), ms(40)]);
}

#[tokio::test]
async fn test_frame_past_its_deadline_is_dropped() {
    let counters = Arc::new(StreamCounters::new());
    let mut buffer = SyncBuffer::new(JitterConfig::default()).with_counters(counters.clone());
    let t0 = Instant::now();

    buffer.push(frame(TrackKind::Audio, 0, t0), t0).unwrap();
    let late = t0 + ms(200);
    let outcome = buffer.push(frame(TrackKind::Audio, 20, late), late).unwrap();

    assert_eq!(outcome, PushOutcome::DroppedLate);
    assert_eq!(buffer.stats().late_drops, 1);
    assert_eq!(counters.sample().frames_dropped, 1);
}

#[tokio::test]
async fn test_jitter_raises_delay_within_bounds() {
    let config = JitterConfig::default();
    let mut buffer = SyncBuffer::new(config.clone());
    let t0 = Instant::now();

    for i in 0..20u64 {
        let wobble = if i % 2 == 0 { 0 } else { 50 };
        let arrival = t0 + ms(i * 20 + wobble);
        let _ = buffer.push(frame(TrackKind::Audio, i * 20, arrival), arrival).unwrap();
    }

    let stats = buffer.stats();
    assert!(stats.audio_jitter > Duration::ZERO);
    assert!(stats.playout_delay > config.base_delay);
    assert!(stats.playout_delay <= config.max_delay);
}

#[tokio::test]
async fn test_av_skew_is_bounded() {
    let config = JitterConfig::default();
    let mut buffer = SyncBuffer::new(config.clone());
    let t0 = Instant::now();

    buffer.push(frame(TrackKind::Audio, 0, t0), t0).unwrap();
    for i in 0..20u64 {
        let audio_arrival = t0 + ms(i * 20);
        let _ = buffer.push(frame(TrackKind::Audio, i * 20, audio_arrival), audio_arrival);

        let wobble = if i % 2 == 0 { 0 } else { 80 };
        let video_arrival = t0 + ms(i * 33 + wobble);
        let _ = buffer.push(frame(TrackKind::Video, i * 33, video_arrival), video_arrival);
    }

    let largest = buffer.playout_delay();
    assert!(largest > config.base_delay + config.max_av_skew);
    assert_eq!(buffer.track_delay(TrackKind::Video), largest);
    assert!(buffer.track_delay(TrackKind::Audio) + config.max_av_skew >= largest);
}

#[tokio::test]
async fn test_full_track_queue_drops_oldest() {
    let config = JitterConfig {
        max_frames_per_track: 2,
        ..JitterConfig::default()
    };
    let mut buffer = SyncBuffer::new(config);
    let t0 = Instant::now();

    buffer.push(frame(TrackKind::Audio, 0, t0), t0).unwrap();
    buffer.push(frame(TrackKind::Audio, 20, t0 + ms(20)), t0 + ms(20)).unwrap();
    let outcome = buffer.push(frame(TrackKind::Audio, 40, t0 + ms(40)), t0 + ms(40)).unwrap();

    assert_eq!(outcome, PushOutcome::QueuedDroppedOldest);
    assert_eq!(buffer.stats().overflow_drops, 1);
    let ready = buffer.pop_ready(t0 + ms(1000));
    assert_eq!(ready[0].pts, ms(20));
}

#[tokio::test]
async fn test_byte_budget_is_fatal() {
    let config = JitterConfig {
        max_buffered_bytes: 10,
        ..JitterConfig::default()
    };
    let mut buffer = SyncBuffer::new(config);
    let t0 = Instant::now();

    let result = buffer.push(frame(TrackKind::Video, 0, t0), t0);
    assert!(matches!(result, Err(PlayerError::ResourceExhausted { .. })));
}

#[tokio::test]
async fn test_flush_forgets_everything() {
    let mut buffer = SyncBuffer::new(JitterConfig::low_latency());
    let t0 = Instant::now();

    buffer.push(frame(TrackKind::Audio, 0, t0), t0).unwrap();
    buffer.push(frame(TrackKind::Video, 0, t0), t0).unwrap();
    assert_eq!(buffer.stats().queued_frames, 2);

    buffer.flush();
    assert!(buffer.is_empty());
    assert_eq!(buffer.stats().buffered_bytes, 0);
    assert!(buffer.pop_ready(t0 + ms(1000)).is_empty());
}
