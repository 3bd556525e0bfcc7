//! # rtplayer Core
//!
//! Transport layer of the rtplayer real-time streaming player: play URL model,
//! RTP/RTCP wire format, the signaling protocol and the session negotiator that
//! turns a `webrtc://` URL into a live media transport.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod metrics;
pub mod rtp;
pub mod signaling;
pub mod track;
pub mod transport;
pub mod url;

// Re-export main types
pub use error::{ErrorKind, PlayerError, PlayerResult};
pub use metrics::{CounterSample, StreamCounters, TrackCounters};
pub use rtp::{
    InboundPacket, NtpTimestamp, RtcpPacket, RtpPacket, RtpPacketizer, SenderReport,
    SequenceUnwrapper,
};
pub use signaling::{PlayAnswer, PlayOffer, SignalingMessage, SignalingResponse, TransportMode};
pub use track::{codec_names, TrackDescription, TrackKind};
pub use transport::{ConnectionConfig, SessionNegotiator, TransportConnection, TransportEvent};
pub use url::PlayUrl;
