//! Configuration management
//!
//! Everything is loaded from one TOML file. Every section and field has a
//! default, so a partial file (or no file at all) is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;
use crate::media::MediaType;
use crate::network::{nearest_relay, GeoPoint, PublisherConfig, RelayEndpoint, SubscriberConfig, TrackSubscription};
use crate::protocol::{ObjectMapping, PriorityClass};
use crate::timing::SyncMode;
use crate::tracks::TrackDescriptor;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

/// Publisher side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_sender_tracks")]
    pub tracks: Vec<TrackDescriptor>,
    /// Idle time before a keep-alive announce, 0 disables it
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    /// Candidate relays, the nearest one to `position` is used
    #[serde(default)]
    pub relays: Vec<RelayEndpoint>,
    #[serde(default)]
    pub position: Option<GeoPoint>,
}

/// Subscriber side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_receiver_tracks")]
    pub tracks: Vec<TrackSubscription>,
    #[serde(default = "default_jitter_buffer_ms")]
    pub jitter_buffer_ms: f64,
    #[serde(default = "default_receive_queue")]
    pub receive_queue: usize,
    /// Video decode queue cap
    #[serde(default = "default_max_queued_chunks")]
    pub max_queued_chunks: usize,
}

/// Capture pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Frames are dropped while the encoder holds more than this
    #[serde(default = "default_encoder_max_queue_size")]
    pub encoder_max_queue_size: usize,
    /// Video key frame interval in frames
    #[serde(default = "default_keyframe_every")]
    pub keyframe_every: u64,
    /// Audio metadata repeat interval in chunks
    #[serde(default = "default_metadata_every")]
    pub metadata_every: u64,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

/// Render side buffers and pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Audio ring size in milliseconds of samples
    #[serde(default = "default_audio_ring_ms")]
    pub audio_ring_ms: u64,
    #[serde(default = "default_pacing_interval_ms")]
    pub pacing_interval_ms: u64,
}

fn default_namespace() -> String {
    "conference".to_string()
}

fn default_sender_tracks() -> Vec<TrackDescriptor> {
    vec![
        TrackDescriptor::new(MediaType::Audio, default_namespace(), "audio0")
            .with_priority(PriorityClass::High)
            .with_mapping(ObjectMapping::ObjectPerStream)
            .with_max_in_flight_requests(DEFAULT_AUDIO_MAX_IN_FLIGHT),
        TrackDescriptor::new(MediaType::Video, default_namespace(), "video0")
            .with_mapping(ObjectMapping::ObjectPerStream),
    ]
}

fn default_receiver_tracks() -> Vec<TrackSubscription> {
    vec![
        TrackSubscription::new(MediaType::Audio, default_namespace(), "audio0"),
        TrackSubscription::new(MediaType::Video, default_namespace(), "video0"),
    ]
}

fn default_keep_alive_ms() -> u64 {
    DEFAULT_KEEP_ALIVE_MS
}

fn default_jitter_buffer_ms() -> f64 {
    DEFAULT_JITTER_BUFFER_MS as f64
}

fn default_receive_queue() -> usize {
    DEFAULT_RECEIVE_QUEUE
}

fn default_max_queued_chunks() -> usize {
    DEFAULT_MAX_DECODE_QUEUE
}

fn default_encoder_max_queue_size() -> usize {
    DEFAULT_ENCODER_MAX_QUEUE
}

fn default_keyframe_every() -> u64 {
    DEFAULT_KEYFRAME_EVERY
}

fn default_metadata_every() -> u64 {
    DEFAULT_METADATA_EVERY
}

fn default_render_buffer_capacity() -> usize {
    DEFAULT_RENDER_BUFFER_CAPACITY
}

fn default_audio_ring_ms() -> u64 {
    DEFAULT_AUDIO_RING_MS
}

fn default_pacing_interval_ms() -> u64 {
    PACING_INTERVAL_MS
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            tracks: default_sender_tracks(),
            keep_alive_ms: default_keep_alive_ms(),
            relays: Vec::new(),
            position: None,
        }
    }
}

impl SenderConfig {
    /// Relay closest to the configured position, the first one without a position
    pub fn relay(&self) -> Option<&RelayEndpoint> {
        match &self.position {
            Some(position) => nearest_relay(position, &self.relays),
            None => self.relays.first(),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            tracks: self.tracks.clone(),
            keep_alive_interval: Duration::from_millis(self.keep_alive_ms),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            tracks: default_receiver_tracks(),
            jitter_buffer_ms: default_jitter_buffer_ms(),
            receive_queue: default_receive_queue(),
            max_queued_chunks: default_max_queued_chunks(),
        }
    }
}

impl ReceiverConfig {
    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            tracks: self.tracks.clone(),
            receive_queue: self.receive_queue,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            encoder_max_queue_size: default_encoder_max_queue_size(),
            keyframe_every: default_keyframe_every(),
            metadata_every: default_metadata_every(),
            sync_mode: SyncMode::default(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_render_buffer_capacity(),
            audio_ring_ms: default_audio_ring_ms(),
            pacing_interval_ms: default_pacing_interval_ms(),
        }
    }
}

impl RenderConfig {
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }
}

impl AppConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Per-user config location, e.g. `~/.config/moq-conference/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "moq", "moq-conference").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                tracing::debug!("No config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.tracks.is_empty() {
            return Err(ConfigError::NoTracks);
        }
        let mut seen = HashSet::new();
        for track in &self.sender.tracks {
            track.validate()?;
            if !seen.insert(track.media_type) {
                return Err(ConfigError::DuplicateTrack(track.media_type.to_string()));
            }
        }
        self.receiver.subscriber_config().validate()?;

        if !self.receiver.jitter_buffer_ms.is_finite() || self.receiver.jitter_buffer_ms <= 0.0 {
            return Err(ConfigError::InvalidValue("jitter_buffer_ms must be > 0".into()));
        }
        let positive = [
            ("max_queued_chunks", self.receiver.max_queued_chunks as u64),
            ("encoder_max_queue_size", self.capture.encoder_max_queue_size as u64),
            ("keyframe_every", self.capture.keyframe_every),
            ("metadata_every", self.capture.metadata_every),
            ("buffer_capacity", self.render.buffer_capacity as u64),
            ("audio_ring_ms", self.render.audio_ring_ms),
            ("pacing_interval_ms", self.render.pacing_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capture.encoder_max_queue_size, 5);
        assert_eq!(config.capture.keyframe_every, 60);
        assert_eq!(config.capture.metadata_every, 20);
        assert_eq!(config.receiver.max_queued_chunks, 60);
        assert_eq!(config.render.pacing_interval(), Duration::from_millis(10));
        assert_eq!(config.sender.tracks.len(), 2);
    }

    #[test]
    fn test_partial_file() {
        let config = AppConfig::from_toml(
            r#"
            [receiver]
            jitter_buffer_ms = 80.0

            [capture]
            keyframe_every = 30
            sync_mode = "independent"

            [[sender.tracks]]
            media_type = "audio"
            namespace = "room1"
            name = "mic"
            auth_info = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.receiver.jitter_buffer_ms, 80.0);
        assert_eq!(config.receiver.receive_queue, DEFAULT_RECEIVE_QUEUE);
        assert_eq!(config.capture.keyframe_every, 30);
        assert_eq!(config.capture.sync_mode, SyncMode::Independent);
        assert_eq!(config.sender.tracks.len(), 1);
        assert_eq!(config.sender.tracks[0].auth_info.as_deref(), Some("secret"));
        assert_eq!(config.sender.tracks[0].max_in_flight_requests, DEFAULT_MAX_IN_FLIGHT_REQUESTS);
        assert_eq!(config.render, RenderConfig::default());
    }

    #[test]
    fn test_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values() {
        let zero_queue = "[capture]\nencoder_max_queue_size = 0\n";
        assert!(matches!(AppConfig::from_toml(zero_queue), Err(ConfigError::InvalidValue(_))));

        let bad_jitter = "[receiver]\njitter_buffer_ms = -5.0\n";
        assert!(matches!(AppConfig::from_toml(bad_jitter), Err(ConfigError::InvalidValue(_))));

        let duplicate = r#"
            [[sender.tracks]]
            media_type = "video"
            namespace = "a"
            name = "v1"

            [[sender.tracks]]
            media_type = "video"
            namespace = "a"
            name = "v2"
        "#;
        assert_eq!(
            AppConfig::from_toml(duplicate),
            Err(ConfigError::DuplicateTrack("video".into()))
        );

        assert!(matches!(AppConfig::from_toml("[render"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_relay_choice() {
        let config = AppConfig::from_toml(
            r#"
            [sender]
            position = { lat = 48.85, lng = 2.35 }

            [[sender.relays]]
            url = "https://relay-us.example"
            location = { lat = 40.7, lng = -74.0 }

            [[sender.relays]]
            url = "https://relay-eu.example"
            location = { lat = 50.1, lng = 8.7 }
            zone = "eu"
            "#,
        )
        .unwrap();
        assert_eq!(config.sender.relay().unwrap().url, "https://relay-eu.example");

        let mut unplaced = config.sender.clone();
        unplaced.position = None;
        assert_eq!(unplaced.relay().unwrap().url, "https://relay-us.example");
        assert!(SenderConfig::default().relay().is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = AppConfig::load("/nonexistent/moq-conference.toml");
        assert!(matches!(result, Err(ConfigError::Read(_))));
    }

    #[test]
    fn test_endpoint_configs() {
        let config = AppConfig::default();
        let publisher = config.sender.publisher_config();
        assert_eq!(publisher.keep_alive_interval, Duration::from_millis(DEFAULT_KEEP_ALIVE_MS));
        assert_eq!(publisher.tracks[0].priority, PriorityClass::High);

        let subscriber = config.receiver.subscriber_config();
        assert_eq!(subscriber.receive_queue, DEFAULT_RECEIVE_QUEUE);
        subscriber.validate().unwrap();
    }
}
