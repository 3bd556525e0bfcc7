//! Shared per-session stream counters
//!
//! Written by the pipeline workers, sampled by the statistics collector.

use crate::track::TrackKind;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Counters of one track
#[derive(Debug, Default)]
pub struct TrackCounters {
    /// Payload bytes received
    pub bytes: AtomicU64,
    /// RTP packets received
    pub packets: AtomicU64,
    /// Frames decoded successfully
    pub frames_decoded: AtomicU64,
    /// Frames dropped (late, incomplete, overflow or failed decode)
    pub frames_dropped: AtomicU64,
    /// Frames handed to the render surface
    pub frames_rendered: AtomicU64,
    /// Interarrival jitter in microseconds
    pub jitter_us: AtomicU64,
}

/// Atomic counters shared by every stage of a session
#[derive(Debug, Default)]
pub struct StreamCounters {
    audio: TrackCounters,
    video: TrackCounters,
    /// Packets inferred lost from sequence gaps
    pub packets_lost: AtomicU64,
    /// Packets arriving after their frame was already emitted or dropped
    pub packets_late: AtomicU64,
    /// Packets discarded because no track claimed them
    pub packets_discarded: AtomicU64,
    /// Current playout delay in microseconds
    pub playout_delay_us: AtomicU64,
    /// Width of the last decoded video frame
    pub video_width: AtomicU32,
    /// Height of the last decoded video frame
    pub video_height: AtomicU32,
}

/// Plain copy of [`StreamCounters`] at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSample {
    /// Audio payload bytes
    pub audio_bytes: u64,
    /// Video payload bytes
    pub video_bytes: u64,
    /// RTP packets received on both tracks
    pub packets_received: u64,
    /// Packets inferred lost
    pub packets_lost: u64,
    /// Packets arriving too late
    pub packets_late: u64,
    /// Unattributed packets discarded
    pub packets_discarded: u64,
    /// Decoded audio frames
    pub audio_frames_decoded: u64,
    /// Decoded video frames
    pub video_frames_decoded: u64,
    /// Frames dropped on both tracks
    pub frames_dropped: u64,
    /// Playout delay
    pub playout_delay: Duration,
    /// Larger of the two track jitters
    pub jitter: Duration,
    /// Last decoded video width
    pub video_width: u32,
    /// Last decoded video height
    pub video_height: u32,
}

impl StreamCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of one track
    pub fn track(&self, kind: TrackKind) -> &TrackCounters {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    /// Record one received RTP packet
    pub fn record_packet(&self, kind: TrackKind, payload_len: usize) {
        let track = self.track(kind);
        track.packets.fetch_add(1, Ordering::Relaxed);
        track.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    /// Add packets inferred lost
    pub fn record_lost(&self, count: u64) {
        self.packets_lost.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a late packet
    pub fn record_late(&self) {
        self.packets_late.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded packet
    pub fn record_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully decoded frame
    pub fn record_decoded(&self, kind: TrackKind) {
        self.track(kind).frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped frame
    pub fn record_dropped(&self, kind: TrackKind) {
        self.track(kind).frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame handed to the render surface
    pub fn record_rendered(&self, kind: TrackKind) {
        self.track(kind).frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the current jitter estimate of a track
    pub fn set_jitter(&self, kind: TrackKind, jitter: Duration) {
        self.track(kind)
            .jitter_us
            .store(jitter.as_micros() as u64, Ordering::Relaxed);
    }

    /// Publish the current playout delay
    pub fn set_playout_delay(&self, delay: Duration) {
        self.playout_delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Publish the last decoded video resolution
    pub fn set_video_size(&self, width: u32, height: u32) {
        self.video_width.store(width, Ordering::Relaxed);
        self.video_height.store(height, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn sample(&self) -> CounterSample {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        CounterSample {
            audio_bytes: load(&self.audio.bytes),
            video_bytes: load(&self.video.bytes),
            packets_received: load(&self.audio.packets) + load(&self.video.packets),
            packets_lost: load(&self.packets_lost),
            packets_late: load(&self.packets_late),
            packets_discarded: load(&self.packets_discarded),
            audio_frames_decoded: load(&self.audio.frames_decoded),
            video_frames_decoded: load(&self.video.frames_decoded),
            frames_dropped: load(&self.audio.frames_dropped) + load(&self.video.frames_dropped),
            playout_delay: Duration::from_micros(load(&self.playout_delay_us)),
            jitter: Duration::from_micros(load(&self.audio.jitter_us).max(load(&self.video.jitter_us))),
            video_width: self.video_width.load(Ordering::Relaxed),
            video_height: self.video_height.load(Ordering::Relaxed),
        }
    }
}
