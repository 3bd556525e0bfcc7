//! Render surface interface and the output gate in front of it
//!
//! The surface is an external collaborator: the player hands it decoded
//! frames and never waits on it. The [`OutputGate`] applies mute flags and
//! volume before anything reaches the surface.

use crate::tracks::{AudioFrame, VideoFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Consumer of decoded frames (a view, an audio device, a recorder)
pub trait RenderSurface: Send + Sync {
    /// Display one video frame
    fn render_video(&self, frame: &VideoFrame);

    /// Play one audio frame
    fn render_audio(&self, frame: &AudioFrame);
}

/// Surface that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderSurface;

impl RenderSurface for NullRenderSurface {
    fn render_video(&self, _frame: &VideoFrame) {}

    fn render_audio(&self, _frame: &AudioFrame) {}
}

/// Render counters kept by the gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Audio frames handed to the surface
    pub audio_rendered: u64,
    /// Audio frames withheld while muted
    pub audio_suppressed: u64,
    /// Video frames handed to the surface
    pub video_rendered: u64,
    /// Video frames withheld while muted
    pub video_suppressed: u64,
}

/// Applies mute flags and volume in front of a [`RenderSurface`]
#[derive(Debug)]
pub struct OutputGate {
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
    volume_bits: AtomicU64,
    audio_rendered: AtomicU64,
    audio_suppressed: AtomicU64,
    video_rendered: AtomicU64,
    video_suppressed: AtomicU64,
}

impl Default for OutputGate {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl OutputGate {
    /// Create an unmuted gate at the given volume (clamped to 0..=1)
    pub fn new(volume: f64) -> Self {
        let volume = if volume.is_nan() { 1.0 } else { volume.clamp(0.0, 1.0) };
        Self {
            audio_muted: AtomicBool::new(false),
            video_muted: AtomicBool::new(false),
            volume_bits: AtomicU64::new(volume.to_bits()),
            audio_rendered: AtomicU64::new(0),
            audio_suppressed: AtomicU64::new(0),
            video_rendered: AtomicU64::new(0),
            video_suppressed: AtomicU64::new(0),
        }
    }

    /// Set the volume, clamped to 0..=1; NaN leaves it unchanged
    ///
    /// Returns the volume now in effect.
    pub fn set_volume(&self, volume: f64) -> f64 {
        if volume.is_nan() {
            return self.volume();
        }
        let clamped = volume.clamp(0.0, 1.0);
        self.volume_bits.store(clamped.to_bits(), Ordering::Release);
        clamped
    }

    /// Current volume
    pub fn volume(&self) -> f64 {
        f64::from_bits(self.volume_bits.load(Ordering::Acquire))
    }

    /// Mute or unmute audio output
    pub fn set_audio_muted(&self, muted: bool) {
        self.audio_muted.store(muted, Ordering::Release);
    }

    /// Mute or unmute video output (decoding continues)
    pub fn set_video_muted(&self, muted: bool) {
        self.video_muted.store(muted, Ordering::Release);
    }

    /// Whether audio is muted
    pub fn is_audio_muted(&self) -> bool {
        self.audio_muted.load(Ordering::Acquire)
    }

    /// Whether video is muted
    pub fn is_video_muted(&self) -> bool {
        self.video_muted.load(Ordering::Acquire)
    }

    /// Hand an audio frame to the surface unless muted; returns whether it was rendered
    pub fn render_audio(&self, surface: &dyn RenderSurface, mut frame: AudioFrame) -> bool {
        if self.is_audio_muted() {
            self.audio_suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let volume = self.volume() as f32;
        if volume < 1.0 {
            for sample in &mut frame.samples {
                *sample *= volume;
            }
        }
        surface.render_audio(&frame);
        self.audio_rendered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Hand a video frame to the surface unless muted; returns whether it was rendered
    pub fn render_video(&self, surface: &dyn RenderSurface, frame: &VideoFrame) -> bool {
        if self.is_video_muted() {
            self.video_suppressed.fetch_add(1, Ordering::Relaxed);
            debug!("Video muted, frame pts={:?} not rendered", frame.pts);
            return false;
        }
        surface.render_video(frame);
        self.video_rendered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Render counters
    pub fn stats(&self) -> GateStats {
        GateStats {
            audio_rendered: self.audio_rendered.load(Ordering::Relaxed),
            audio_suppressed: self.audio_suppressed.load(Ordering::Relaxed),
            video_rendered: self.video_rendered.load(Ordering::Relaxed),
            video_suppressed: self.video_suppressed.load(Ordering::Relaxed),
        }
    }
}
