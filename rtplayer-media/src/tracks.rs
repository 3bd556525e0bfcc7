//! Frame types moved between pipeline stages

use bytes::Bytes;
use rtplayer_core::TrackKind;
use std::time::{Duration, Instant};

/// A reassembled, still encoded frame
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Track the frame belongs to
    pub kind: TrackKind,
    /// Codec name from the track description
    pub codec: String,
    /// Presentation timestamp on the session timeline
    pub pts: Duration,
    /// RTP timestamp of the frame
    pub rtp_timestamp: u32,
    /// Encoded payload (Annex-B for H.264)
    pub payload: Bytes,
    /// Whether the frame can be decoded on its own
    pub is_keyframe: bool,
    /// When the last packet of the frame arrived
    pub arrival: Instant,
}

impl EncodedFrame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Audio frame representation
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved samples (f32 PCM, -1.0..=1.0)
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u8,
    /// Presentation timestamp
    pub pts: Duration,
}

impl AudioFrame {
    /// Playback duration of the frame
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

/// Video frame representation (planar I420)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Y plane followed by the U and V planes
    pub data: Vec<u8>,
    /// Presentation timestamp
    pub pts: Duration,
    /// Whether this is a keyframe
    pub is_keyframe: bool,
}

/// Decoded media frame types
#[derive(Debug, Clone)]
pub enum MediaFrame {
    /// Audio frame
    Audio(AudioFrame),
    /// Video frame
    Video(VideoFrame),
}

impl MediaFrame {
    /// Track kind of the frame
    pub fn kind(&self) -> TrackKind {
        match self {
            MediaFrame::Audio(_) => TrackKind::Audio,
            MediaFrame::Video(_) => TrackKind::Video,
        }
    }

    /// Presentation timestamp
    pub fn pts(&self) -> Duration {
        match self {
            MediaFrame::Audio(frame) => frame.pts,
            MediaFrame::Video(frame) => frame.pts,
        }
    }
}
