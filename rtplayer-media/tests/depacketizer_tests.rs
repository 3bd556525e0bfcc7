//! Tests for demultiplexing, reordering and frame reassembly

use bytes::Bytes;
use rtplayer_core::{
    codec_names, InboundPacket, NtpTimestamp, RtcpPacket, RtpPacket, SenderReport,
    StreamCounters, TrackDescription, TrackKind,
};
use rtplayer_media::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

const AUDIO_SSRC: u32 = 0x1111;
const VIDEO_SSRC: u32 = 0x2222;

fn audio_track() -> TrackDescription {
    TrackDescription::audio(codec_names::L16, 97, AUDIO_SSRC, 16000, 1)
}

fn video_track() -> TrackDescription {
    TrackDescription::video(codec_names::RAW_I420, 96, VIDEO_SSRC)
}

fn depacketizer(tracks: &[TrackDescription]) -> (Depacketizer, Arc<StreamCounters>) {
    let counters = Arc::new(StreamCounters::new());
    let demux = Depacketizer::new(DepacketizerConfig::default(), tracks, counters.clone());
    (demux, counters)
}

fn audio_packet(seq: u16, ts: u32) -> RtpPacket {
    RtpPacket::new(97, seq, ts, AUDIO_SSRC, false, Bytes::from_static(&[0, 1, 0, 2]))
}

fn video_packet(seq: u16, ts: u32, marker: bool, payload: &'static [u8]) -> RtpPacket {
    RtpPacket::new(96, seq, ts, VIDEO_SSRC, marker, Bytes::from_static(payload))
}

fn frames(events: &[DemuxEvent]) -> Vec<&EncodedFrame> {
    events
        .iter()
        .filter_map(|e| match e {
            DemuxEvent::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

// ============================================================================
// AUDIO
// ============================================================================

#[tokio::test]
async fn test_audio_packets_become_frames_in_order() {
    let (mut demux, counters) = depacketizer(&[audio_track()]);
    let now = Instant::now();

    let first = demux.push_rtp(audio_packet(100, 0), now);
    assert_eq!(first.len(), 2);
    assert!(matches!(first[0], DemuxEvent::TrackReceived(TrackKind::Audio)));
    let frame = frames(&first)[0];
    assert_eq!(frame.pts, Duration::ZERO);
    assert_eq!(frame.kind, TrackKind::Audio);

    let second = demux.push_rtp(audio_packet(101, 320), now + Duration::from_millis(20));
    assert_eq!(second.len(), 1);
    assert_eq!(frames(&second)[0].pts, Duration::from_millis(20));

    let sample = counters.sample();
    assert_eq!(sample.packets_received, 2);
    assert_eq!(sample.audio_bytes, 8);
}

#[tokio::test]
async fn test_track_received_is_raised_once() {
    let (mut demux, _) = depacketizer(&[audio_track()]);
    let now = Instant::now();

    let mut announcements = 0;
    for i in 0..5u16 {
        let events = demux.push_rtp(audio_packet(i, i as u32 * 320), now);
        announcements += events
            .iter()
            .filter(|e| matches!(e, DemuxEvent::TrackReceived(_)))
            .count();
    }
    assert_eq!(announcements, 1);
}

#[tokio::test]
async fn test_audio_gap_counts_loss_and_keeps_later_packets() {
    let (mut demux, counters) = depacketizer(&[audio_track()]);
    let t0 = Instant::now();

    demux.push_rtp(audio_packet(1, 0), t0);
    let held = demux.push_rtp(audio_packet(3, 640), t0);
    assert!(held.is_empty(), "packet after a gap waits for the gap to fill");

    let released = demux.poll(t0 + Duration::from_millis(200));
    let released = frames(&released);
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].pts, Duration::from_millis(40));
    assert_eq!(counters.sample().packets_lost, 1);

    // The missing packet finally shows up
    let late = demux.push_rtp(audio_packet(2, 320), t0 + Duration::from_millis(210));
    assert!(late.is_empty());
    assert_eq!(counters.sample().packets_late, 1);
}

#[tokio::test]
async fn test_single_lost_audio_packet_costs_one_frame_downstream() {
    let (mut demux, counters) = depacketizer(&[audio_track()]);
    let mut buffer = SyncBuffer::new(JitterConfig::default()).with_counters(counters.clone());
    let t0 = Instant::now();

    let mut delivered = 0;
    for i in 0..30u16 {
        let now = t0 + Duration::from_millis(20 * i as u64);
        let mut events = Vec::new();
        if i != 1 {
            events.extend(demux.push_rtp(audio_packet(i, i as u32 * 320), now));
        }
        events.extend(demux.poll(now));
        for frame in frames(&events) {
            let outcome = buffer.push(frame.clone(), now).unwrap();
            assert_ne!(outcome, PushOutcome::DroppedLate, "pts {:?} missed its deadline", frame.pts);
        }
        delivered += buffer.pop_ready(now).len();
    }
    delivered += buffer.pop_ready(t0 + Duration::from_secs(2)).len();

    assert_eq!(delivered, 29);
    assert_eq!(buffer.stats().late_drops, 0);
    let sample = counters.sample();
    assert_eq!(sample.packets_lost, 1);
    assert_eq!(sample.frames_dropped, 0);
}

#[tokio::test]
async fn test_sequence_wraparound_is_continuous() {
    let (mut demux, counters) = depacketizer(&[audio_track()]);
    let now = Instant::now();

    let mut emitted = 0;
    for (i, seq) in [65534u16, 65535, 0, 1].into_iter().enumerate() {
        emitted += frames(&demux.push_rtp(audio_packet(seq, i as u32 * 320), now)).len();
    }
    assert_eq!(emitted, 4);
    assert_eq!(counters.sample().packets_lost, 0);
}

#[tokio::test]
async fn test_duplicate_packet_is_ignored() {
    let (mut demux, counters) = depacketizer(&[video_track()]);
    let now = Instant::now();

    demux.push_rtp(video_packet(10, 0, false, b"ab"), now);
    demux.push_rtp(video_packet(10, 0, false, b"ab"), now);
    let events = demux.push_rtp(video_packet(11, 0, true, b"cd"), now);

    let frame = frames(&events)[0];
    assert_eq!(&frame.payload[..], b"abcd");
    assert_eq!(counters.sample().packets_received, 2);
}

// ============================================================================
// VIDEO
// ============================================================================

#[tokio::test]
async fn test_reordered_video_frames_are_reassembled() {
    let (mut demux, _) = depacketizer(&[video_track()]);
    let now = Instant::now();

    let mut out = Vec::new();
    out.extend(demux.push_rtp(video_packet(10, 0, false, b"A1"), now));
    out.extend(demux.push_rtp(video_packet(12, 3000, false, b"B1"), now));
    out.extend(demux.push_rtp(video_packet(11, 0, true, b"A2"), now));
    out.extend(demux.push_rtp(video_packet(13, 3000, true, b"B2"), now));

    let out = frames(&out);
    assert_eq!(out.len(), 2);
    assert_eq!(&out[0].payload[..], b"A1A2");
    assert_eq!(&out[1].payload[..], b"B1B2");
    assert!(out[0].pts < out[1].pts);
    assert_eq!(out[1].pts, Duration::from_micros(3000 * 1_000_000 / 90_000));
}

#[tokio::test]
async fn test_video_frame_missing_its_start_is_dropped() {
    let (mut demux, counters) = depacketizer(&[video_track()]);
    let t0 = Instant::now();

    demux.push_rtp(video_packet(10, 0, false, b"A1"), t0);
    demux.push_rtp(video_packet(11, 0, true, b"A2"), t0);
    // seq 12 (start of frame B) is lost
    demux.push_rtp(video_packet(13, 3000, true, b"B2"), t0);
    demux.push_rtp(video_packet(14, 6000, true, b"C1"), t0);

    let events = demux.poll(t0 + Duration::from_millis(200));
    let out = frames(&events);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].rtp_timestamp, 6000);

    let sample = counters.sample();
    assert_eq!(sample.packets_lost, 1);
    assert_eq!(sample.frames_dropped, 1);
}

#[tokio::test]
async fn test_frame_after_lost_tail_is_kept() {
    let (mut demux, counters) = depacketizer(&[video_track()]);
    let t0 = Instant::now();

    demux.push_rtp(video_packet(0, 0, false, b"A1"), t0);
    demux.push_rtp(video_packet(1, 0, false, b"A2"), t0);
    // seq 2, the marker packet of frame A, is lost
    demux.push_rtp(video_packet(3, 3000, false, b"B1"), t0);
    demux.push_rtp(video_packet(4, 3000, true, b"B2"), t0);

    let events = demux.poll(t0 + Duration::from_millis(400));
    let out = frames(&events);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].rtp_timestamp, 3000);
    assert_eq!(&out[0].payload[..], b"B1B2");

    let sample = counters.sample();
    assert_eq!(sample.packets_lost, 1);
    assert_eq!(sample.frames_dropped, 1);
}

#[tokio::test]
async fn test_h264_fragment_start_resyncs_after_gap() {
    let track = TrackDescription::video(codec_names::H264, 102, VIDEO_SSRC);
    let (mut demux, counters) = depacketizer(&[track]);
    let t0 = Instant::now();
    let packet = |seq, ts, marker, payload: &'static [u8]| {
        RtpPacket::new(102, seq, ts, VIDEO_SSRC, marker, Bytes::from_static(payload))
    };

    let first = demux.push_rtp(packet(0, 0, true, &[0x41, 0x9a]), t0);
    assert_eq!(frames(&first).len(), 1);
    // seq 1 is lost; seq 2 opens a fragmented IDR slice
    demux.push_rtp(packet(2, 3000, false, &[0x7c, 0x85, 0x88]), t0);
    demux.push_rtp(packet(3, 3000, true, &[0x7c, 0x45, 0x84]), t0);

    let events = demux.poll(t0 + Duration::from_millis(400));
    let out = frames(&events);
    assert_eq!(out.len(), 1);
    assert!(out[0].is_keyframe);
    assert_eq!(&out[0].payload[..], &[0, 0, 0, 1, 0x65, 0x88, 0x84]);
    assert_eq!(counters.sample().frames_dropped, 0);
}

#[tokio::test]
async fn test_h264_track_emits_annex_b_keyframe() {
    let track = TrackDescription::video(codec_names::H264, 102, VIDEO_SSRC);
    let (mut demux, _) = depacketizer(&[track]);

    let packet = RtpPacket::new(
        102,
        1,
        0,
        VIDEO_SSRC,
        true,
        Bytes::from_static(&[0x65, 0x88, 0x84]),
    );
    let events = demux.push_rtp(packet, Instant::now());
    let frame = frames(&events)[0];

    assert!(frame.is_keyframe);
    assert_eq!(&frame.payload[..], &[0, 0, 0, 1, 0x65, 0x88, 0x84]);
}

// ============================================================================
// DEMULTIPLEXING
// ============================================================================

#[tokio::test]
async fn test_payload_type_fallback_when_ssrc_differs() {
    let (mut demux, _) = depacketizer(&[audio_track(), video_track()]);
    let packet = RtpPacket::new(97, 5, 0, 0xdead, false, Bytes::from_static(&[0, 0]));

    let events = demux.push_rtp(packet, Instant::now());
    assert_eq!(frames(&events)[0].kind, TrackKind::Audio);
}

#[tokio::test]
async fn test_unknown_track_is_held_then_announced() {
    let (mut demux, _) = depacketizer(&[audio_track()]);
    let now = Instant::now();

    let events = demux.push_rtp(video_packet(1, 0, true, b"V"), now);
    assert!(events.is_empty());
    assert_eq!(demux.unknown_backlog(), 1);

    let events = demux.announce_track(video_track(), now + Duration::from_millis(50));
    assert!(matches!(events[0], DemuxEvent::TrackReceived(TrackKind::Video)));
    assert_eq!(frames(&events).len(), 1);
    assert_eq!(demux.unknown_backlog(), 0);
    assert_eq!(demux.tracks().count(), 2);
}

#[tokio::test]
async fn test_unknown_packets_expire_after_grace() {
    let (mut demux, counters) = depacketizer(&[audio_track()]);
    let t0 = Instant::now();

    demux.push_rtp(video_packet(1, 0, true, b"V"), t0);
    demux.poll(t0 + Duration::from_millis(100));
    assert_eq!(demux.unknown_backlog(), 1);

    demux.poll(t0 + Duration::from_millis(600));
    assert_eq!(demux.unknown_backlog(), 0);
    assert_eq!(counters.sample().packets_discarded, 1);
}

// ============================================================================
// TIMELINE
// ============================================================================

#[tokio::test]
async fn test_sender_reports_align_tracks() {
    let (mut demux, _) = depacketizer(&[audio_track(), video_track()]);
    let now = Instant::now();

    let reports = vec![
        RtcpPacket::SenderReport(SenderReport {
            ssrc: AUDIO_SSRC,
            ntp: NtpTimestamp::from_parts(1000, 0),
            rtp_timestamp: 0,
            packet_count: 0,
            octet_count: 0,
        }),
        RtcpPacket::SenderReport(SenderReport {
            ssrc: VIDEO_SSRC,
            // 1000.1 s
            ntp: NtpTimestamp::from_parts(1000, 429_496_730),
            rtp_timestamp: 9000,
            packet_count: 0,
            octet_count: 0,
        }),
    ];
    assert!(demux.push(InboundPacket::Rtcp(reports), now).is_empty());

    let audio = demux.push_rtp(audio_packet(1, 0), now);
    assert_eq!(frames(&audio)[0].pts, Duration::ZERO);

    let video = demux.push_rtp(video_packet(1, 9000, true, b"V1"), now);
    assert_eq!(frames(&video)[0].pts, Duration::from_millis(100));

    let video = demux.push_rtp(video_packet(2, 18000, true, b"V2"), now);
    assert_eq!(frames(&video)[0].pts, Duration::from_millis(200));
}
