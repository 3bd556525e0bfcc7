//! Negotiated track descriptions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl TrackKind {
    /// Both kinds, audio first
    pub const ALL: [TrackKind; 2] = [TrackKind::Audio, TrackKind::Video];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known codec names carried in track descriptions
pub mod codec_names {
    /// RFC 3551 linear 16-bit PCM, big-endian
    pub const L16: &str = "L16";
    /// Uncompressed I420 frames prefixed by a width/height header
    pub const RAW_I420: &str = "x-raw-i420";
    /// Opus audio
    pub const OPUS: &str = "opus";
    /// H.264 video (RFC 6184 packetization)
    pub const H264: &str = "H264";
}

/// One track as announced by the origin in its answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescription {
    /// Audio or video
    pub kind: TrackKind,
    /// Codec name (see [`codec_names`])
    pub codec: String,
    /// RTP payload type
    pub payload_type: u8,
    /// RTP synchronization source
    pub ssrc: u32,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
    /// Channel count for audio tracks
    pub channels: Option<u8>,
}

impl TrackDescription {
    /// Describe an audio track
    pub fn audio(codec: &str, payload_type: u8, ssrc: u32, clock_rate: u32, channels: u8) -> Self {
        Self {
            kind: TrackKind::Audio,
            codec: codec.to_string(),
            payload_type,
            ssrc,
            clock_rate,
            channels: Some(channels),
        }
    }

    /// Describe a video track
    pub fn video(codec: &str, payload_type: u8, ssrc: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            codec: codec.to_string(),
            payload_type,
            ssrc,
            clock_rate: 90_000,
            channels: None,
        }
    }

    /// Whether frames of this track use RFC 6184 packetization
    pub fn is_h264(&self) -> bool {
        self.codec.eq_ignore_ascii_case(codec_names::H264)
    }
}
