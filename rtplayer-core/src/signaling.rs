//! Signaling protocol messages exchanged with the stream origin
//!
//! Messages travel as JSON text frames on the signaling WebSocket. When the
//! interleaved transport is in use, RTP and RTCP ride on the same socket as
//! binary frames.

use crate::track::{TrackDescription, TrackKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Magic prefix of a UDP binding request
pub const BINDING_REQUEST: &[u8; 4] = b"RTPB";
/// Magic prefix of a UDP binding response
pub const BINDING_RESPONSE: &[u8; 4] = b"RTPA";

/// How media reaches the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    /// RTP datagrams on a dedicated UDP socket
    Udp,
    /// RTP carried as binary frames on the signaling WebSocket
    Interleaved,
}

/// Request to play a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayOffer {
    /// Stream path, e.g. `live/camera`
    pub stream: String,
    /// Client identifier for origin-side logging
    pub client_id: String,
    /// Transport modes the client accepts, in order of preference
    pub transports: Vec<TransportMode>,
    /// Codec names the client can decode
    pub codecs: Vec<String>,
}

/// Origin's answer to a [`PlayOffer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayAnswer {
    /// Origin-assigned session id
    pub session_id: String,
    /// Tracks the origin will send
    pub tracks: Vec<TrackDescription>,
    /// UDP candidates the client may check, in priority order
    pub candidates: Vec<SocketAddr>,
    /// Token echoed in binding requests so the origin can match the client
    pub binding_token: u64,
}

/// Client to origin messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingMessage {
    /// Start playing a stream
    Play(PlayOffer),
    /// Connectivity is settled and media may flow
    TransportReady {
        /// Mode the client selected
        mode: TransportMode,
    },
    /// Hint that the client stopped (or resumed) consuming a track
    TrackControl {
        /// Track kind
        kind: TrackKind,
        /// Whether the client wants the track
        enabled: bool,
    },
    /// Keepalive
    Ping,
    /// Client is leaving
    Stop,
}

/// Origin to client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingResponse {
    /// Successful answer to a play request
    Answer(PlayAnswer),
    /// Request failed
    Error {
        /// Human readable message
        error: String,
        /// Upper-snake error code, see [`crate::PlayerError::from_remote`]
        error_code: String,
    },
    /// A track that was not part of the answer is about to be sent
    TrackAnnounced(TrackDescription),
    /// Keepalive reply
    Pong,
    /// The origin finished sending the stream
    EndOfStream,
}

/// Build a binding request or response datagram
pub fn binding_datagram(prefix: &[u8; 4], token: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[..4].copy_from_slice(prefix);
    out[4..].copy_from_slice(&token.to_be_bytes());
    out
}

/// Extract the token of a binding datagram with the given prefix
pub fn parse_binding(prefix: &[u8; 4], data: &[u8]) -> Option<u64> {
    if data.len() != 12 || &data[..4] != prefix {
        return None;
    }
    let mut token = [0u8; 8];
    token.copy_from_slice(&data[4..]);
    Some(u64::from_be_bytes(token))
}
