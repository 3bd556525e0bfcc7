//! Play URL parsing and signaling endpoint derivation

use crate::error::PlayerError;
use std::fmt;
use url::Url;

/// Scheme accepted by [`PlayUrl::parse`]
pub const PLAY_SCHEME: &str = "webrtc";

/// A validated `webrtc://host[:port]/app/stream` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayUrl {
    raw: String,
    host: String,
    port: Option<u16>,
    stream_path: String,
    query: Option<String>,
}

impl PlayUrl {
    /// Parse and validate a play URL
    pub fn parse(input: &str) -> Result<Self, PlayerError> {
        let parsed = Url::parse(input.trim()).map_err(|e| PlayerError::InvalidUrl {
            url: input.to_string(),
            reason: e.to_string(),
        })?;

        if !parsed.scheme().eq_ignore_ascii_case(PLAY_SCHEME) {
            return Err(PlayerError::UnsupportedScheme {
                scheme: parsed.scheme().to_string(),
            });
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PlayerError::InvalidUrl {
                url: input.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let stream_path = parsed.path().trim_matches('/').to_string();
        if stream_path.is_empty() {
            return Err(PlayerError::InvalidUrl {
                url: input.to_string(),
                reason: "missing stream path".to_string(),
            });
        }

        Ok(Self {
            raw: input.trim().to_string(),
            host,
            port: parsed.port(),
            stream_path,
            query: parsed.query().map(str::to_string),
        })
    }

    /// URL as given by the caller
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if the URL carried one
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Stream path without surrounding slashes, e.g. `live/camera`
    pub fn stream_path(&self) -> &str {
        &self.stream_path
    }

    /// Query string, if any
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Port used for signaling given the TLS choice and defaults
    pub fn signaling_port(&self, secure: bool, default_port: u16, default_tls_port: u16) -> u16 {
        self.port
            .unwrap_or(if secure { default_tls_port } else { default_port })
    }

    /// WebSocket signaling endpoint for this stream
    pub fn signaling_url(&self, secure: bool, port: u16, path: &str) -> String {
        let scheme = if secure { "wss" } else { "ws" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}://{}:{}/{}", scheme, host, port, path.trim_start_matches('/'))
    }
}

impl fmt::Display for PlayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for PlayUrl {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
