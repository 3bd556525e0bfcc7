//! Error types for rtplayer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error categories surfaced to the event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// DNS failure, refused connection, timeout or remote closure
    Connection,
    /// TLS validation failure, or TLS required but not enabled
    Certificate,
    /// Malformed or unsupported stream
    Protocol,
    /// Codec failure
    Decode,
    /// Buffer or memory exhaustion
    Resource,
}

impl ErrorKind {
    /// Stable string form of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Certificate => "certificate",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Decode => "decode",
            ErrorKind::Resource => "resource",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for rtplayer operations
#[derive(Error, Debug)]
pub enum PlayerError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// The play URL could not be parsed
    #[error("Invalid play URL {url}: {reason}")]
    InvalidUrl {
        /// URL as given by the caller
        url: String,
        /// Reason the URL was rejected
        reason: String,
    },

    /// The play URL uses a scheme the player cannot negotiate
    #[error("Unsupported URL scheme: {scheme}")]
    UnsupportedScheme {
        /// Offending scheme
        scheme: String,
    },

    /// Host name resolution failed
    #[error("DNS resolution failed for {host}: {reason}")]
    DnsResolution {
        /// Host that failed to resolve
        host: String,
        /// Resolver error
        reason: String,
    },

    /// Connection error
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection {
        /// Endpoint that could not be reached
        endpoint: String,
        /// Reason for connection failure
        reason: String,
    },

    /// Operation timed out error
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// Certificate validation failed, or TLS is required but was not enabled
    #[error("Certificate error for {endpoint}: {reason}")]
    Certificate {
        /// Endpoint whose certificate was rejected
        endpoint: String,
        /// Reason for the rejection
        reason: String,
    },

    /// The origin does not know the requested stream
    #[error("Stream not found: {stream}")]
    StreamNotFound {
        /// Stream path that was requested
        stream: String,
    },

    /// Protocol error
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for protocol error
        reason: String,
    },

    /// A single packet could not be parsed
    #[error("Invalid packet: {reason}")]
    InvalidPacket {
        /// Reason the packet was rejected
        reason: String,
    },

    /// Unsupported codec error
    #[error("Unsupported codec: {codec}")]
    UnsupportedCodec {
        /// Codec name
        codec: String,
    },

    /// Decoding operation failed
    #[error("Decoding failed: {codec} - {reason}")]
    Decoding {
        /// Codec name
        codec: String,
        /// Reason for failure
        reason: String,
    },

    /// Resource exhausted error
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted {
        /// Resource that was exhausted
        resource: String,
    },

    /// The transport closed underneath an active session
    #[error("Transport closed: {reason}")]
    TransportClosed {
        /// Reason for the closure
        reason: String,
    },
}

impl PlayerError {
    /// Category reported to the event sink
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::DnsResolution { .. }
            | PlayerError::Connection { .. }
            | PlayerError::Timeout { .. }
            | PlayerError::TransportClosed { .. } => ErrorKind::Connection,
            PlayerError::Certificate { .. } => ErrorKind::Certificate,
            PlayerError::InvalidUrl { .. }
            | PlayerError::UnsupportedScheme { .. }
            | PlayerError::StreamNotFound { .. }
            | PlayerError::Protocol { .. }
            | PlayerError::InvalidPacket { .. }
            | PlayerError::UnsupportedCodec { .. } => ErrorKind::Protocol,
            PlayerError::Decoding { .. } => ErrorKind::Decode,
            PlayerError::ResourceExhausted { .. } | PlayerError::Initialization { .. } => {
                ErrorKind::Resource
            }
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            PlayerError::Initialization { .. } => "INITIALIZATION_FAILED".to_string(),
            PlayerError::InvalidUrl { .. } => "INVALID_URL".to_string(),
            PlayerError::UnsupportedScheme { .. } => "UNSUPPORTED_SCHEME".to_string(),
            PlayerError::DnsResolution { .. } => "DNS_RESOLUTION_FAILED".to_string(),
            PlayerError::Connection { .. } => "CONNECTION_FAILED".to_string(),
            PlayerError::Timeout { .. } => "TIMEOUT".to_string(),
            PlayerError::Certificate { .. } => "CERTIFICATE_ERROR".to_string(),
            PlayerError::StreamNotFound { .. } => "STREAM_NOT_FOUND".to_string(),
            PlayerError::Protocol { .. } => "PROTOCOL_ERROR".to_string(),
            PlayerError::InvalidPacket { .. } => "INVALID_PACKET".to_string(),
            PlayerError::UnsupportedCodec { .. } => "UNSUPPORTED_CODEC".to_string(),
            PlayerError::Decoding { .. } => "DECODING_FAILED".to_string(),
            PlayerError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED".to_string(),
            PlayerError::TransportClosed { .. } => "TRANSPORT_CLOSED".to_string(),
        }
    }

    /// Build the error a peer reported through signaling
    pub fn from_remote(error_code: &str, message: &str) -> Self {
        match error_code {
            "STREAM_NOT_FOUND" => PlayerError::StreamNotFound {
                stream: message.to_string(),
            },
            "TLS_REQUIRED" | "CERTIFICATE_ERROR" => PlayerError::Certificate {
                endpoint: "origin".to_string(),
                reason: message.to_string(),
            },
            "UNSUPPORTED_CODEC" => PlayerError::UnsupportedCodec {
                codec: message.to_string(),
            },
            "RESOURCE_EXHAUSTED" => PlayerError::ResourceExhausted {
                resource: message.to_string(),
            },
            _ => PlayerError::Protocol {
                reason: format!("{} ({})", message, error_code),
            },
        }
    }
}

/// Result alias used across the rtplayer crates
pub type PlayerResult<T> = Result<T, PlayerError>;
