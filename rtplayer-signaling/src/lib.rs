//! # rtplayer Signaling
//!
//! A small stream origin for rtplayer: it answers play requests on a
//! WebSocket signaling endpoint and sends synthetic audio and video over RTP,
//! either on UDP or interleaved on the signaling socket. Used by the demos
//! and by the end-to-end tests of the player.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod origin;
pub mod source;

// Re-export main types
pub use origin::{OriginConfig, OriginHandle, SessionInfo, StreamOrigin, TlsPolicy, TLS_REQUIRED};
pub use source::{AudioSource, SyntheticStream, VideoSource};
