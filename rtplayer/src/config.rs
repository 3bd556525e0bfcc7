//! Configuration types and defaults

use rtplayer_core::ConnectionConfig;
use rtplayer_media::{DepacketizerConfig, JitterConfig};
use std::time::Duration;

/// Decode stage settings
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Consecutive failed decodes on one track before the session fails
    pub max_consecutive_decode_errors: u32,
    /// Frames queued in front of each decoder before new ones are dropped
    pub decoder_queue: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_consecutive_decode_errors: 10,
            decoder_queue: 64,
        }
    }
}

/// Player configuration
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Negotiation settings; the offered codecs are taken from the player's codec registry
    pub connection: ConnectionConfig,
    /// Reassembly settings
    pub depacketizer: DepacketizerConfig,
    /// Jitter buffer settings
    pub jitter: JitterConfig,
    /// Decode settings
    pub decode: DecodeConfig,
    /// Volume at creation (clamped to 0..=1)
    pub initial_volume: f64,
    /// Statistics period in seconds at creation, 0 disables
    pub statistics_interval_secs: u32,
    /// Also tell the origin when a track is muted so it can stop sending it
    pub signal_mute_to_server: bool,
    /// Silence after which a session fails with a connection error
    pub media_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            depacketizer: DepacketizerConfig::default(),
            jitter: JitterConfig::default(),
            decode: DecodeConfig::default(),
            initial_volume: 1.0,
            statistics_interval_secs: 0,
            signal_mute_to_server: false,
            media_timeout: Duration::from_secs(10),
        }
    }
}

impl PlayerConfig {
    /// Short buffers and timeouts for local networks
    pub fn low_latency() -> Self {
        Self {
            connection: ConnectionConfig::low_latency(),
            jitter: JitterConfig::low_latency(),
            media_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Deep buffers and generous timeouts for lossy networks
    pub fn smooth() -> Self {
        Self {
            connection: ConnectionConfig::resilient(),
            jitter: JitterConfig::smooth(),
            media_timeout: Duration::from_secs(20),
            ..Self::default()
        }
    }

    /// Connection settings with the player-level overrides applied
    pub(crate) fn effective_connection(&self, codecs: Vec<String>) -> ConnectionConfig {
        ConnectionConfig {
            media_timeout: self.media_timeout,
            offered_codecs: codecs,
            ..self.connection.clone()
        }
    }
}
