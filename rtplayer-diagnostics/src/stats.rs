//! Periodic statistics sampling
//!
//! The collector runs as one worker of a playback session. It reads the
//! session's [`StreamCounters`] on a fixed period and turns the deltas since
//! the previous sample into an immutable [`StatisticsSnapshot`]. A period of
//! zero disables sampling; the period can change while the worker runs.

use chrono::{DateTime, Utc};
use rtplayer_core::{CounterSample, StreamCounters};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Point-in-time playback statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Wall-clock time of the sample
    pub sampled_at: DateTime<Utc>,
    /// Time covered by the rate fields
    pub period: Duration,
    /// Receive bitrate over the period, both tracks
    pub bitrate_kbps: f64,
    /// Audio receive bitrate over the period
    pub audio_bitrate_kbps: f64,
    /// Video receive bitrate over the period
    pub video_bitrate_kbps: f64,
    /// RTP packets received since the session started
    pub packets_received: u64,
    /// Packets inferred lost since the session started
    pub packets_lost: u64,
    /// Fraction of expected packets lost during the period (0.0..=1.0)
    pub loss_fraction: f64,
    /// Packets that arrived after their frame was gone
    pub packets_late: u64,
    /// Delay between arrival and release of frames
    pub playout_delay: Duration,
    /// Interarrival jitter (larger of the two tracks)
    pub jitter: Duration,
    /// Frames decoded on both tracks
    pub frames_decoded: u64,
    /// Frames dropped on both tracks
    pub frames_dropped: u64,
    /// Decoded video frames per second over the period
    pub frame_rate: f64,
    /// Last decoded video width (0 before the first frame)
    pub video_width: u32,
    /// Last decoded video height (0 before the first frame)
    pub video_height: u32,
    /// Audio payload bytes received
    pub audio_bytes: u64,
    /// Video payload bytes received
    pub video_bytes: u64,
}

impl StatisticsSnapshot {
    /// Build a snapshot from two counter samples taken `period` apart
    pub fn from_samples(previous: &CounterSample, current: &CounterSample, period: Duration) -> Self {
        let secs = period.as_secs_f64();
        let rate = |bytes: u64| {
            if secs > 0.0 {
                bytes as f64 * 8.0 / 1000.0 / secs
            } else {
                0.0
            }
        };

        let audio_delta = current.audio_bytes.saturating_sub(previous.audio_bytes);
        let video_delta = current.video_bytes.saturating_sub(previous.video_bytes);
        let received = current.packets_received.saturating_sub(previous.packets_received);
        let lost = current.packets_lost.saturating_sub(previous.packets_lost);
        let expected = received + lost;
        let video_frames = current
            .video_frames_decoded
            .saturating_sub(previous.video_frames_decoded);

        Self {
            sampled_at: Utc::now(),
            period,
            bitrate_kbps: rate(audio_delta + video_delta),
            audio_bitrate_kbps: rate(audio_delta),
            video_bitrate_kbps: rate(video_delta),
            packets_received: current.packets_received,
            packets_lost: current.packets_lost,
            loss_fraction: if expected > 0 {
                lost as f64 / expected as f64
            } else {
                0.0
            },
            packets_late: current.packets_late,
            playout_delay: current.playout_delay,
            jitter: current.jitter,
            frames_decoded: current.audio_frames_decoded + current.video_frames_decoded,
            frames_dropped: current.frames_dropped,
            frame_rate: if secs > 0.0 { video_frames as f64 / secs } else { 0.0 },
            video_width: current.video_width,
            video_height: current.video_height,
            audio_bytes: current.audio_bytes,
            video_bytes: current.video_bytes,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Shared, adjustable sampling period in whole seconds (0 disables)
#[derive(Debug, Clone)]
pub struct StatisticsInterval {
    tx: Arc<watch::Sender<u32>>,
}

impl StatisticsInterval {
    /// Create with an initial period
    pub fn new(seconds: u32) -> Self {
        let (tx, _) = watch::channel(seconds);
        Self { tx: Arc::new(tx) }
    }

    /// Change the period; running collectors pick it up immediately
    pub fn configure(&self, seconds: u32) {
        self.tx.send_if_modified(|current| {
            if *current == seconds {
                return false;
            }
            *current = seconds;
            true
        });
    }

    /// Current period in seconds
    pub fn get(&self) -> u32 {
        *self.tx.borrow()
    }

    /// Receiver for a collector
    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }
}

impl Default for StatisticsInterval {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Samples stream counters into snapshots
#[derive(Debug)]
pub struct StatisticsCollector {
    counters: Arc<StreamCounters>,
    interval: watch::Receiver<u32>,
    baseline: Option<(Instant, CounterSample)>,
}

impl StatisticsCollector {
    /// Create a collector over a session's counters
    pub fn new(counters: Arc<StreamCounters>, interval: &StatisticsInterval) -> Self {
        Self {
            counters,
            interval: interval.subscribe(),
            baseline: None,
        }
    }

    /// Take a sample now, relative to the previous one
    pub fn sample(&mut self) -> StatisticsSnapshot {
        let now = Instant::now();
        let current = self.counters.sample();
        let (since, previous) = self.baseline.unwrap_or((now, current));
        self.baseline = Some((now, current));
        StatisticsSnapshot::from_samples(&previous, &current, now - since)
    }

    fn rebase(&mut self) {
        self.baseline = Some((Instant::now(), self.counters.sample()));
    }

    /// Emit snapshots until cancelled
    ///
    /// Ticks that fall behind are skipped rather than bunched up. `emit`
    /// runs on the collector task and must not block.
    pub async fn run<F>(mut self, cancel: CancellationToken, mut emit: F)
    where
        F: FnMut(StatisticsSnapshot),
    {
        // false once the interval owner is gone and the period is final
        let mut follow = true;
        loop {
            let seconds = *self.interval.borrow_and_update();
            if seconds == 0 {
                if !follow {
                    cancel.cancelled().await;
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = self.interval.changed() => {
                        follow = changed.is_ok();
                        continue;
                    }
                }
            }

            let period = Duration::from_secs(seconds as u64);
            debug!("Statistics every {:?}", period);
            self.rebase();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = self.interval.changed(), if follow => {
                        follow = changed.is_ok();
                        if follow {
                            break;
                        }
                    }
                    _ = ticker.tick() => emit(self.sample()),
                }
            }
        }
    }
}
