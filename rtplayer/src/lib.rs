//! # rtplayer - Real-Time Streaming Player
//!
//! rtplayer plays live streams published by a real-time origin. Give it a
//! `webrtc://host[:port]/app/stream` URL and it negotiates a session over
//! WebSocket signaling, receives RTP over UDP (or interleaved on the
//! signaling socket when UDP is blocked), reassembles and synchronizes audio
//! and video, decodes them and hands the frames to a render surface.
//!
//! ## Key Features
//!
//! - **One call to play**: `play(url, support_https)` and `stop()`, safe from any task
//! - **Adaptive jitter buffer**: per-track delay with bounded audio/video skew
//! - **Pluggable codecs**: built-in L16 and raw I420, Opus and H.264 behind features
//! - **Observable**: state changes, first-frame and track events, periodic statistics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rtplayer::{ChannelEventSink, EventSink, PlayerConfig, RtPlayer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let player = RtPlayer::new(PlayerConfig::low_latency())?;
//!
//!     let (sink, mut events) = ChannelEventSink::new();
//!     let sink: Arc<dyn EventSink> = sink;
//!     player.set_event_sink(&sink);
//!     player.set_statistics_interval(1);
//!
//!     player.play("webrtc://127.0.0.1:1985/live/stream", false).await?;
//!     while let Some(event) = events.next().await {
//!         println!("Player event: {:?}", event);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use rtplayer_core::{
    codec_names, ConnectionConfig, ErrorKind, PlayUrl, PlayerError, PlayerResult, TrackDescription,
    TrackKind, TransportMode,
};

pub use rtplayer_media::{
    AudioFrame, CodecInfo, CodecRegistry, DepacketizerConfig, JitterConfig, MediaDecoder,
    MediaFrame, NullRenderSurface, RenderSurface, VideoFrame,
};

pub use rtplayer_diagnostics::{StatisticsSnapshot, VersionInfo};

// Public API modules
pub mod config;
pub mod event;
pub mod player;
pub mod state;

mod session;

// Re-export main API types
pub use config::{DecodeConfig, PlayerConfig};
pub use event::{ChannelEventSink, EventSink, EventStream, PlayerEvent};
pub use player::{PlayerSnapshot, RtPlayer};
pub use state::{PlayState, SessionState, StateMachine, Transition};
