//! Synthetic media published by the origin
//!
//! Audio is a sine tone in L16; video is a moving luma gradient in
//! `x-raw-i420`. Both are cheap to generate and easy to verify on the
//! receiving side.

use rtplayer_core::{codec_names, TrackDescription, TrackKind};
use rtplayer_media::RawI420Decoder;
use std::f32::consts::TAU;
use std::time::Duration;

/// Payload type used for the synthetic audio track
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;
/// Payload type used for the synthetic video track
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
/// SSRC of the synthetic audio track
pub const AUDIO_SSRC: u32 = 0x5EED_0A01;
/// SSRC of the synthetic video track
pub const VIDEO_SSRC: u32 = 0x5EED_0B01;

/// Tone generator settings
#[derive(Debug, Clone)]
pub struct AudioSource {
    /// Sample rate (also the RTP clock rate)
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Duration of one frame
    pub frame_duration: Duration,
    /// Tone frequency
    pub tone_hz: f32,
}

impl Default for AudioSource {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_duration: Duration::from_millis(20),
            tone_hz: 440.0,
        }
    }
}

impl AudioSource {
    /// Samples per channel in one frame
    pub fn samples_per_frame(&self) -> u32 {
        (self.sample_rate as u64 * self.frame_duration.as_micros() as u64 / 1_000_000) as u32
    }

    /// Encode frame `index` as big-endian L16
    pub fn frame(&self, index: u64) -> Vec<u8> {
        let per_frame = self.samples_per_frame() as u64;
        let channels = self.channels.max(1) as usize;
        let mut out = Vec::with_capacity(per_frame as usize * channels * 2);
        for n in 0..per_frame {
            let t = (index * per_frame + n) as f32 / self.sample_rate as f32;
            let value = ((TAU * self.tone_hz * t).sin() * 0.25 * i16::MAX as f32) as i16;
            for _ in 0..channels {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        out
    }
}

/// Test pattern settings
#[derive(Debug, Clone)]
pub struct VideoSource {
    /// Picture width
    pub width: u16,
    /// Picture height
    pub height: u16,
    /// Frames per second
    pub fps: u32,
}

impl Default for VideoSource {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            fps: 15,
        }
    }
}

impl VideoSource {
    /// Interval between frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }

    /// Encode frame `index` as an `x-raw-i420` payload
    pub fn frame(&self, index: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        let shift = (index * 4) as usize;

        let mut planes = Vec::with_capacity(w * h + 2 * chroma);
        for y in 0..h {
            for x in 0..w {
                planes.push(((x + y + shift) % 256) as u8);
            }
        }
        planes.resize(w * h + 2 * chroma, 128);
        RawI420Decoder::encode(self.width, self.height, &planes)
    }
}

/// A stream the origin can serve
#[derive(Debug, Clone, Default)]
pub struct SyntheticStream {
    /// Audio track, if any
    pub audio: Option<AudioSource>,
    /// Video track, if any
    pub video: Option<VideoSource>,
    /// Stream length; the origin sends end-of-stream afterwards
    pub duration: Option<Duration>,
    /// Leave video out of the answer and announce it once it starts
    pub announce_video_late: bool,
}

impl SyntheticStream {
    /// Audio and video with default settings
    pub fn audio_video() -> Self {
        Self {
            audio: Some(AudioSource::default()),
            video: Some(VideoSource::default()),
            ..Self::default()
        }
    }

    /// Audio only
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioSource::default()),
            ..Self::default()
        }
    }

    /// Video only
    pub fn video_only(width: u16, height: u16, fps: u32) -> Self {
        Self {
            video: Some(VideoSource { width, height, fps }),
            ..Self::default()
        }
    }

    /// End the stream after `duration`
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Announce the video track after the answer instead of in it
    pub fn with_late_video(mut self) -> Self {
        self.announce_video_late = true;
        self
    }

    /// Description of one track
    pub fn track(&self, kind: TrackKind) -> Option<TrackDescription> {
        match kind {
            TrackKind::Audio => self.audio.as_ref().map(|a| {
                TrackDescription::audio(
                    codec_names::L16,
                    AUDIO_PAYLOAD_TYPE,
                    AUDIO_SSRC,
                    a.sample_rate,
                    a.channels,
                )
            }),
            TrackKind::Video => self
                .video
                .as_ref()
                .map(|_| TrackDescription::video(codec_names::RAW_I420, VIDEO_PAYLOAD_TYPE, VIDEO_SSRC)),
        }
    }

    /// Tracks listed in the answer
    pub fn answered_tracks(&self) -> Vec<TrackDescription> {
        TrackKind::ALL
            .iter()
            .filter(|kind| !(self.announce_video_late && **kind == TrackKind::Video))
            .filter_map(|kind| self.track(*kind))
            .collect()
    }

    /// Codec names the stream needs
    pub fn codecs(&self) -> Vec<String> {
        TrackKind::ALL
            .iter()
            .filter_map(|kind| self.track(*kind))
            .map(|t| t.codec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_is_twenty_ms_of_l16() {
        let source = AudioSource::default();
        assert_eq!(source.samples_per_frame(), 320);
        assert_eq!(source.frame(0).len(), 640);
    }

    #[test]
    fn video_frame_has_header_and_planes() {
        let source = VideoSource {
            width: 4,
            height: 2,
            fps: 10,
        };
        let frame = source.frame(1);
        assert_eq!(&frame[..4], &[0, 4, 0, 2]);
        assert_eq!(frame.len(), 4 + RawI420Decoder::picture_len(4, 2));
        assert_eq!(source.frame_interval(), Duration::from_millis(100));
    }

    #[test]
    fn late_video_is_left_out_of_the_answer() {
        let stream = SyntheticStream::audio_video().with_late_video();
        let answered = stream.answered_tracks();
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].kind, TrackKind::Audio);
        assert_eq!(stream.codecs().len(), 2);
    }
}
