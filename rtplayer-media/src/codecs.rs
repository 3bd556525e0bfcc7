//! Decoder interface, registry and built-in decoders
//!
//! Each track gets its own decoder instance from the [`CodecRegistry`]. The
//! built-in decoders handle uncompressed formats; compressed codecs live
//! behind the `opus` and `h264` features and wrap external libraries.

use crate::tracks::{AudioFrame, EncodedFrame, MediaFrame, VideoFrame};
use rtplayer_core::{codec_names, PlayerError, TrackDescription, TrackKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "opus")]
use audiopus::{coder::Decoder as OpusDecoder, Channels, SampleRate};

#[cfg(feature = "h264")]
use openh264::{decoder::Decoder as H264Decoder, formats::YUVSource};

/// Result type for codec operations
pub type CodecResult<T> = Result<T, PlayerError>;

/// Codec information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    /// Codec name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// Sample rate (for audio)
    pub sample_rate: Option<u32>,
    /// Channels (for audio)
    pub channels: Option<u8>,
}

/// Decodes the frames of one track
///
/// Decoders are stateful and owned by a single decode worker.
pub trait MediaDecoder: Send + fmt::Debug {
    /// Decode one frame; `Ok(None)` means the decoder needs more input
    fn decode(&mut self, frame: &EncodedFrame) -> CodecResult<Option<MediaFrame>>;

    /// Get codec information
    fn codec_info(&self) -> CodecInfo;
}

/// Builds a decoder for a negotiated track
pub type DecoderFactory = Arc<dyn Fn(&TrackDescription) -> CodecResult<Box<dyn MediaDecoder>> + Send + Sync>;

/// Codec registry for dynamic decoder selection
#[derive(Clone)]
pub struct CodecRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.list_codecs())
            .finish()
    }
}

impl CodecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with every decoder compiled into this build
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(codec_names::L16, |desc| {
            Ok(Box::new(L16Decoder::new(desc.clock_rate, desc.channels.unwrap_or(1))?))
        });
        registry.register(codec_names::RAW_I420, |_| Ok(Box::new(RawI420Decoder)));

        #[cfg(feature = "opus")]
        registry.register(codec_names::OPUS, |desc| {
            Ok(Box::new(OpusTrackDecoder::new(desc.clock_rate, desc.channels.unwrap_or(2))?))
        });

        #[cfg(feature = "h264")]
        registry.register(codec_names::H264, |_| Ok(Box::new(H264TrackDecoder::new()?)));

        registry
    }

    /// Register a decoder factory under a codec name (case-insensitive)
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&TrackDescription) -> CodecResult<Box<dyn MediaDecoder>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Whether a codec can be decoded
    pub fn supports(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    /// Build a decoder for a track
    pub fn create_decoder(&self, track: &TrackDescription) -> CodecResult<Box<dyn MediaDecoder>> {
        let factory = self
            .factories
            .get(&track.codec.to_ascii_lowercase())
            .ok_or_else(|| PlayerError::UnsupportedCodec {
                codec: track.codec.clone(),
            })?;
        factory(track)
    }

    /// List available codecs
    pub fn list_codecs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// RFC 3551 L16: big-endian signed 16-bit PCM
#[derive(Debug, Clone)]
pub struct L16Decoder {
    sample_rate: u32,
    channels: u8,
}

impl L16Decoder {
    /// Create a decoder for the given format
    pub fn new(sample_rate: u32, channels: u8) -> CodecResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(PlayerError::Decoding {
                codec: codec_names::L16.to_string(),
                reason: format!("invalid format {} Hz x {} channels", sample_rate, channels),
            });
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }
}

impl MediaDecoder for L16Decoder {
    fn decode(&mut self, frame: &EncodedFrame) -> CodecResult<Option<MediaFrame>> {
        let sample_bytes = 2 * self.channels as usize;
        if frame.payload.is_empty() || frame.payload.len() % sample_bytes != 0 {
            return Err(PlayerError::Decoding {
                codec: codec_names::L16.to_string(),
                reason: format!(
                    "payload of {} bytes is not a whole number of {}-byte samples",
                    frame.payload.len(),
                    sample_bytes
                ),
            });
        }

        let samples = frame
            .payload
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();

        Ok(Some(MediaFrame::Audio(AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            pts: frame.pts,
        })))
    }

    fn codec_info(&self) -> CodecInfo {
        CodecInfo {
            name: codec_names::L16.to_string(),
            mime_type: "audio/L16".to_string(),
            sample_rate: Some(self.sample_rate),
            channels: Some(self.channels),
        }
    }
}

/// Uncompressed I420 frames behind a 4-byte header (u16 BE width, u16 BE height)
#[derive(Debug, Clone, Copy, Default)]
pub struct RawI420Decoder;

impl RawI420Decoder {
    /// Size of the width/height header
    pub const HEADER_LEN: usize = 4;

    /// Bytes of an I420 picture of the given size
    pub fn picture_len(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
    }

    /// Build a frame payload (used by senders and tests)
    pub fn encode(width: u16, height: u16, planes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + planes.len());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(planes);
        out
    }
}

impl MediaDecoder for RawI420Decoder {
    fn decode(&mut self, frame: &EncodedFrame) -> CodecResult<Option<MediaFrame>> {
        let invalid = |reason: String| PlayerError::Decoding {
            codec: codec_names::RAW_I420.to_string(),
            reason,
        };

        if frame.payload.len() < Self::HEADER_LEN {
            return Err(invalid("missing picture header".to_string()));
        }
        let width = u16::from_be_bytes([frame.payload[0], frame.payload[1]]) as u32;
        let height = u16::from_be_bytes([frame.payload[2], frame.payload[3]]) as u32;
        if width == 0 || height == 0 {
            return Err(invalid(format!("empty picture {}x{}", width, height)));
        }

        let planes = &frame.payload[Self::HEADER_LEN..];
        let expected = Self::picture_len(width, height);
        if planes.len() != expected {
            return Err(invalid(format!(
                "{}x{} picture needs {} bytes, got {}",
                width,
                height,
                expected,
                planes.len()
            )));
        }

        Ok(Some(MediaFrame::Video(VideoFrame {
            width,
            height,
            data: planes.to_vec(),
            pts: frame.pts,
            is_keyframe: true,
        })))
    }

    fn codec_info(&self) -> CodecInfo {
        CodecInfo {
            name: codec_names::RAW_I420.to_string(),
            mime_type: "video/x-raw-i420".to_string(),
            sample_rate: None,
            channels: None,
        }
    }
}

/// Opus decoder backed by libopus
#[cfg(feature = "opus")]
pub struct OpusTrackDecoder {
    decoder: OpusDecoder,
    sample_rate: u32,
    channels: u8,
    pcm: Vec<i16>,
}

#[cfg(feature = "opus")]
impl fmt::Debug for OpusTrackDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpusTrackDecoder")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

#[cfg(feature = "opus")]
impl OpusTrackDecoder {
    /// Largest Opus frame: 120 ms at 48 kHz
    const MAX_FRAME_SAMPLES: usize = 5760;

    /// Create a decoder for the given output format
    pub fn new(sample_rate: u32, channels: u8) -> CodecResult<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Hz8000,
            12000 => SampleRate::Hz12000,
            16000 => SampleRate::Hz16000,
            24000 => SampleRate::Hz24000,
            48000 => SampleRate::Hz48000,
            _ => {
                return Err(PlayerError::UnsupportedCodec {
                    codec: format!("opus at {} Hz", sample_rate),
                })
            }
        };
        let layout = if channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };
        let decoder = OpusDecoder::new(rate, layout).map_err(|e| PlayerError::Decoding {
            codec: codec_names::OPUS.to_string(),
            reason: format!("Failed to create Opus decoder: {:?}", e),
        })?;
        let channels = if channels == 1 { 1 } else { 2 };

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            pcm: vec![0i16; Self::MAX_FRAME_SAMPLES * channels as usize],
        })
    }
}

#[cfg(feature = "opus")]
impl MediaDecoder for OpusTrackDecoder {
    fn decode(&mut self, frame: &EncodedFrame) -> CodecResult<Option<MediaFrame>> {
        let decoded = self
            .decoder
            .decode(Some(&frame.payload[..]), &mut self.pcm, false)
            .map_err(|e| PlayerError::Decoding {
                codec: codec_names::OPUS.to_string(),
                reason: format!("Opus decoding failed: {:?}", e),
            })?;

        let total = decoded * self.channels as usize;
        let samples = self.pcm[..total].iter().map(|&s| s as f32 / 32768.0).collect();

        Ok(Some(MediaFrame::Audio(AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            pts: frame.pts,
        })))
    }

    fn codec_info(&self) -> CodecInfo {
        CodecInfo {
            name: codec_names::OPUS.to_string(),
            mime_type: "audio/opus".to_string(),
            sample_rate: Some(self.sample_rate),
            channels: Some(self.channels),
        }
    }
}

/// H.264 decoder backed by OpenH264
#[cfg(feature = "h264")]
pub struct H264TrackDecoder {
    decoder: H264Decoder,
}

#[cfg(feature = "h264")]
impl fmt::Debug for H264TrackDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H264TrackDecoder").finish()
    }
}

#[cfg(feature = "h264")]
impl H264TrackDecoder {
    /// Create a decoder
    pub fn new() -> CodecResult<Self> {
        let decoder = H264Decoder::new().map_err(|e| PlayerError::Decoding {
            codec: codec_names::H264.to_string(),
            reason: format!("Failed to create H.264 decoder: {}", e),
        })?;
        Ok(Self { decoder })
    }
}

#[cfg(feature = "h264")]
impl MediaDecoder for H264TrackDecoder {
    fn decode(&mut self, frame: &EncodedFrame) -> CodecResult<Option<MediaFrame>> {
        let decoded = self
            .decoder
            .decode(&frame.payload)
            .map_err(|e| PlayerError::Decoding {
                codec: codec_names::H264.to_string(),
                reason: format!("H.264 decoding failed: {}", e),
            })?;
        let Some(yuv) = decoded else {
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
        let mut data = Vec::with_capacity(width * height + 2 * cw * ch);
        for row in 0..height {
            data.extend_from_slice(&yuv.y()[row * y_stride..row * y_stride + width]);
        }
        for row in 0..ch {
            data.extend_from_slice(&yuv.u()[row * u_stride..row * u_stride + cw]);
        }
        for row in 0..ch {
            data.extend_from_slice(&yuv.v()[row * v_stride..row * v_stride + cw]);
        }

        Ok(Some(MediaFrame::Video(VideoFrame {
            width: width as u32,
            height: height as u32,
            data,
            pts: frame.pts,
            is_keyframe: frame.is_keyframe,
        })))
    }

    fn codec_info(&self) -> CodecInfo {
        CodecInfo {
            name: codec_names::H264.to_string(),
            mime_type: "video/H264".to_string(),
            sample_rate: None,
            channels: None,
        }
    }
}

/// Kind of media a codec name produces, if known
pub fn codec_kind(name: &str) -> Option<TrackKind> {
    let name = name.to_ascii_lowercase();
    if name == codec_names::L16.to_ascii_lowercase() || name == codec_names::OPUS {
        Some(TrackKind::Audio)
    } else if name == codec_names::RAW_I420 || name == codec_names::H264.to_ascii_lowercase() {
        Some(TrackKind::Video)
    } else {
        None
    }
}
