//! # rtplayer Media
//!
//! Receive-side media pipeline for rtplayer: depacketization and
//! demultiplexing, the jitter and sync buffer, decoders and the render gate.

#![warn(clippy::all)]

pub mod codecs;
pub mod depacketizer;
pub mod h264;
pub mod jitter;
pub mod render;
pub mod tracks;

// Re-export main types
pub use codecs::{
    codec_kind, CodecInfo, CodecRegistry, CodecResult, DecoderFactory, L16Decoder, MediaDecoder,
    RawI420Decoder,
};
pub use depacketizer::{DemuxEvent, Depacketizer, DepacketizerConfig};
pub use jitter::{JitterConfig, PushOutcome, SyncBuffer, SyncStats};
pub use render::{GateStats, NullRenderSurface, OutputGate, RenderSurface};
pub use tracks::{AudioFrame, EncodedFrame, MediaFrame, VideoFrame};
