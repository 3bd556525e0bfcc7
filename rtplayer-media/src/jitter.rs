//! Jitter and sync buffer
//!
//! Frames of every track are scheduled on one session clock: the first frame
//! fixes an anchor (arrival instant, pts) and each later frame is released at
//! `anchor + (pts - anchor_pts) + delay(track)`. Each track adapts its own
//! target delay from an RFC 3550 interarrival jitter estimate, and the delays
//! applied are pulled together so that two frames with the same pts are never
//! released more than `max_av_skew` apart.

use crate::tracks::EncodedFrame;
use rtplayer_core::{PlayerError, PlayerResult, StreamCounters, TrackKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Jitter buffer configuration
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Delay added on top of the jitter allowance
    pub base_delay: Duration,
    /// Lower bound of the adaptive delay
    pub min_delay: Duration,
    /// Upper bound of the adaptive delay
    pub max_delay: Duration,
    /// Jitter multiplier in the delay target
    pub jitter_multiplier: f64,
    /// Largest release offset between equal timestamps of different tracks
    pub max_av_skew: Duration,
    /// How far past its release instant a frame may arrive and still play
    pub late_tolerance: Duration,
    /// Per-track queue length before the oldest frame is dropped
    pub max_frames_per_track: usize,
    /// Total payload bytes the buffer may hold before failing the session
    pub max_buffered_bytes: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(60),
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            jitter_multiplier: 3.0,
            max_av_skew: Duration::from_millis(40),
            late_tolerance: Duration::from_millis(5),
            max_frames_per_track: 256,
            max_buffered_bytes: 64 * 1024 * 1024,
        }
    }
}

impl JitterConfig {
    /// Small buffer for interactive use
    pub fn low_latency() -> Self {
        Self {
            base_delay: Duration::from_millis(30),
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(300),
            jitter_multiplier: 2.0,
            ..Self::default()
        }
    }

    /// Large buffer that rides out bursty networks
    pub fn smooth() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            jitter_multiplier: 4.0,
            max_frames_per_track: 1024,
            ..Self::default()
        }
    }
}

/// What happened to a pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued for release
    Queued,
    /// Frame queued, the track's oldest frame was dropped to make room
    QueuedDroppedOldest,
    /// Frame arrived after its release deadline and was dropped
    DroppedLate,
}

/// Buffer statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Largest delay currently applied
    pub playout_delay: Duration,
    /// Jitter estimate of the audio track
    pub audio_jitter: Duration,
    /// Jitter estimate of the video track
    pub video_jitter: Duration,
    /// Frames waiting for release
    pub queued_frames: usize,
    /// Payload bytes waiting for release
    pub buffered_bytes: usize,
    /// Frames dropped for arriving late
    pub late_drops: u64,
    /// Frames dropped because a queue was full
    pub overflow_drops: u64,
}

/// RFC 3550 interarrival jitter, in seconds
#[derive(Debug, Default)]
struct JitterEstimator {
    last: Option<(Instant, Duration)>,
    jitter: f64,
}

impl JitterEstimator {
    fn update(&mut self, arrival: Instant, pts: Duration) {
        if let Some((last_arrival, last_pts)) = self.last {
            let arrival_delta = signed_secs(arrival, last_arrival);
            let media_delta = pts.as_secs_f64() - last_pts.as_secs_f64();
            let d = arrival_delta - media_delta;
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last = Some((arrival, pts));
    }

    fn value(&self) -> Duration {
        Duration::from_secs_f64(self.jitter.max(0.0))
    }
}

fn signed_secs(a: Instant, b: Instant) -> f64 {
    if a >= b {
        (a - b).as_secs_f64()
    } else {
        -(b - a).as_secs_f64()
    }
}

#[derive(Debug, Default)]
struct TrackQueue {
    /// Keyed by (pts, insertion order)
    frames: BTreeMap<(Duration, u64), EncodedFrame>,
    inserted: u64,
    jitter: JitterEstimator,
    target_delay: Duration,
}

/// Per-session jitter and sync buffer
#[derive(Debug)]
pub struct SyncBuffer {
    config: JitterConfig,
    anchor: Option<(Instant, Duration)>,
    tracks: BTreeMap<TrackKind, TrackQueue>,
    buffered_bytes: usize,
    late_drops: u64,
    overflow_drops: u64,
    counters: Option<Arc<StreamCounters>>,
}

impl SyncBuffer {
    /// Create an empty buffer
    pub fn new(config: JitterConfig) -> Self {
        Self {
            config,
            anchor: None,
            tracks: BTreeMap::new(),
            buffered_bytes: 0,
            late_drops: 0,
            overflow_drops: 0,
            counters: None,
        }
    }

    /// Publish drops, jitter and delay to shared counters
    pub fn with_counters(mut self, counters: Arc<StreamCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Queue a frame; frames already past their deadline are dropped
    ///
    /// Exceeding the byte budget is fatal for the session.
    pub fn push(&mut self, frame: EncodedFrame, now: Instant) -> PlayerResult<PushOutcome> {
        let kind = frame.kind;
        let (anchor_at, anchor_pts) = *self.anchor.get_or_insert((frame.arrival, frame.pts));

        let config = &self.config;
        let queue = self.tracks.entry(kind).or_default();
        queue.jitter.update(frame.arrival, frame.pts);
        let jitter = queue.jitter.value();
        queue.target_delay = (config.base_delay + jitter.mul_f64(config.jitter_multiplier))
            .clamp(config.min_delay, config.max_delay);
        if let Some(counters) = &self.counters {
            counters.set_jitter(kind, jitter);
        }
        self.publish_delay();

        let release_at = self.release_instant(anchor_at, anchor_pts, kind, frame.pts);
        if now > release_at + self.config.late_tolerance {
            self.late_drops += 1;
            if let Some(counters) = &self.counters {
                counters.record_dropped(kind);
            }
            debug!(
                "Dropping late {} frame pts={:?} ({:?} past deadline)",
                kind,
                frame.pts,
                now - release_at
            );
            return Ok(PushOutcome::DroppedLate);
        }

        if self.buffered_bytes + frame.len() > self.config.max_buffered_bytes {
            return Err(PlayerError::ResourceExhausted {
                resource: format!(
                    "jitter buffer holds {} bytes, limit {}",
                    self.buffered_bytes, self.config.max_buffered_bytes
                ),
            });
        }

        let max_frames = self.config.max_frames_per_track.max(1);
        let queue = self.tracks.entry(kind).or_default();
        let mut outcome = PushOutcome::Queued;
        if queue.frames.len() >= max_frames {
            if let Some((_, oldest)) = queue.frames.pop_first() {
                self.buffered_bytes -= oldest.len();
                self.overflow_drops += 1;
                if let Some(counters) = &self.counters {
                    counters.record_dropped(kind);
                }
                warn!("{} queue full, dropped frame pts={:?}", kind, oldest.pts);
                outcome = PushOutcome::QueuedDroppedOldest;
            }
        }

        self.buffered_bytes += frame.len();
        queue.inserted += 1;
        queue.frames.insert((frame.pts, queue.inserted), frame);
        Ok(outcome)
    }

    /// Remove every frame whose release instant has passed, earliest first
    pub fn pop_ready(&mut self, now: Instant) -> Vec<EncodedFrame> {
        let Some((anchor_at, anchor_pts)) = self.anchor else {
            return Vec::new();
        };

        let mut ready: Vec<(Instant, EncodedFrame)> = Vec::new();
        let kinds: Vec<TrackKind> = self.tracks.keys().copied().collect();
        for kind in kinds {
            loop {
                let Some(pts) = self.tracks[&kind].frames.keys().next().map(|(pts, _)| *pts) else {
                    break;
                };
                let release_at = self.release_instant(anchor_at, anchor_pts, kind, pts);
                if release_at > now {
                    break;
                }
                let Some((_, frame)) = self.tracks.get_mut(&kind).and_then(|q| q.frames.pop_first())
                else {
                    break;
                };
                self.buffered_bytes -= frame.len();
                ready.push((release_at, frame));
            }
        }

        ready.sort_by_key(|(release_at, _)| *release_at);
        ready.into_iter().map(|(_, frame)| frame).collect()
    }

    /// Earliest release instant among queued frames
    pub fn next_deadline(&self) -> Option<Instant> {
        let (anchor_at, anchor_pts) = self.anchor?;
        self.tracks
            .iter()
            .filter_map(|(kind, queue)| {
                queue
                    .frames
                    .keys()
                    .next()
                    .map(|(pts, _)| self.release_instant(anchor_at, anchor_pts, *kind, *pts))
            })
            .min()
    }

    /// Delay applied to a track after skew limiting
    pub fn track_delay(&self, kind: TrackKind) -> Duration {
        let own = self
            .tracks
            .get(&kind)
            .map(|q| q.target_delay)
            .unwrap_or(self.config.base_delay);
        let largest = self.playout_delay();
        own.max(largest.saturating_sub(self.config.max_av_skew))
    }

    /// Largest target delay across tracks
    pub fn playout_delay(&self) -> Duration {
        self.tracks
            .values()
            .map(|q| q.target_delay)
            .max()
            .unwrap_or(self.config.base_delay)
    }

    /// Drop every queued frame and forget the anchor
    pub fn flush(&mut self) {
        self.tracks.clear();
        self.anchor = None;
        self.buffered_bytes = 0;
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.tracks.values().all(|q| q.frames.is_empty())
    }

    /// Current statistics
    pub fn stats(&self) -> SyncStats {
        let jitter = |kind| {
            self.tracks
                .get(&kind)
                .map(|q: &TrackQueue| q.jitter.value())
                .unwrap_or_default()
        };
        SyncStats {
            playout_delay: self.playout_delay(),
            audio_jitter: jitter(TrackKind::Audio),
            video_jitter: jitter(TrackKind::Video),
            queued_frames: self.tracks.values().map(|q| q.frames.len()).sum(),
            buffered_bytes: self.buffered_bytes,
            late_drops: self.late_drops,
            overflow_drops: self.overflow_drops,
        }
    }

    fn release_instant(
        &self,
        anchor_at: Instant,
        anchor_pts: Duration,
        kind: TrackKind,
        pts: Duration,
    ) -> Instant {
        let delay = self.track_delay(kind);
        if pts >= anchor_pts {
            anchor_at + (pts - anchor_pts) + delay
        } else {
            let early = anchor_pts - pts;
            (anchor_at + delay).checked_sub(early).unwrap_or(anchor_at)
        }
    }

    fn publish_delay(&self) {
        if let Some(counters) = &self.counters {
            counters.set_playout_delay(self.playout_delay());
        }
    }
}
