//! # MoQ Conference
//!
//! Real-time audio/video conferencing core over a MOQT-style
//! publish/subscribe transport.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── PUBLISHER ────────────────────────────────┐
//! │  ┌─────────────┐                                   ┌─────────────┐        │
//! │  │ Audio frame │                                   │ Video frame │        │
//! │  └──────┬──────┘                                   └──────┬──────┘        │
//! │         ▼                                                 ▼               │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │        SyncOffsetCoordinator (timing::sync) - shared origin      │    │
//! │  └──────┬─────────────────────────────────────────────────┬─────────┘    │
//! │         ▼                                                 ▼               │
//! │  ┌─────────────┐   TimeCorrelationIndex            ┌─────────────┐        │
//! │  │  Capture    │   encoder queue cap               │  Capture    │        │
//! │  │  Pipeline   │   key frames / metadata           │  Pipeline   │        │
//! │  └──────┬──────┘                                   └──────┬──────┘        │
//! │         └──────────────────────┬──────────────────────────┘               │
//! │                                ▼                                          │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │   PublisherSession (network::sender)                             │    │
//! │  │   SETUP / ANNOUNCE / SUBSCRIBE, in-flight caps, object mapping   │    │
//! │  └──────────────────────────────┬───────────────────────────────────┘    │
//! └─────────────────────────────────┼─────────────────────────────────────────┘
//!                                   │ Transport (QUIC or in-memory)
//!                                   ▼
//! ┌─────────────────────────────────┼──────────── SUBSCRIBER ─────────────────┐
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │   SubscriberSession (network::receiver)                          │    │
//! │  └──────┬─────────────────────────────────────────────────┬─────────┘    │
//! │         ▼                                                 ▼               │
//! │  ┌─────────────┐                                   ┌─────────────┐        │
//! │  │ JitterBuffer│ -> DecodePipeline                 │ JitterBuffer│        │
//! │  │  + decoder  │                                   │  + decoder  │        │
//! │  └──────┬──────┘                                   └──────┬──────┘        │
//! │         ▼                                                 ▼               │
//! │  ┌─────────────┐      PlaybackClock                ┌─────────────┐        │
//! │  │ Circular    │ ────────────────────────────────▶ │ VideoPacer  │        │
//! │  │ AudioBuffer │                                   │ RenderBuffer│        │
//! │  └─────────────┘                                   └─────────────┘        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod timing;
pub mod tracks;
pub mod video;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    pub use crate::protocol::PROTOCOL_VERSION;

    /// Default jitter buffer size in milliseconds
    pub const DEFAULT_JITTER_BUFFER_MS: u32 = 200;

    /// Decoded video frames held before rendering
    pub const DEFAULT_RENDER_BUFFER_CAPACITY: usize = 60;

    /// Timing records kept per capture or decode pipeline
    pub const TIME_INDEX_MAX_RECORDS: usize = 300;

    /// `sample index -> timestamp` entries kept by the audio ring
    pub const MAX_ITEMS_IN_TS_INDEX: usize = 30;

    /// Pending sends per subscriber for video tracks
    pub const DEFAULT_MAX_IN_FLIGHT_REQUESTS: usize = 50;

    /// Pending sends per subscriber for audio tracks
    pub const DEFAULT_AUDIO_MAX_IN_FLIGHT: usize = 100;

    /// Idle time before the publisher sends a keep-alive announce
    pub const DEFAULT_KEEP_ALIVE_MS: u64 = 5_000;

    /// Objects queued on one long-lived stream writer
    pub const STREAM_WRITER_QUEUE: usize = 64;

    /// Received objects queued between the subscriber session and the decoders
    pub const DEFAULT_RECEIVE_QUEUE: usize = 256;

    /// Video key frame interval in frames
    pub const DEFAULT_KEYFRAME_EVERY: u64 = 60;

    /// Audio metadata repeat interval in chunks
    pub const DEFAULT_METADATA_EVERY: u64 = 20;

    /// Frames the encoder may hold before new frames are dropped
    pub const DEFAULT_ENCODER_MAX_QUEUE: usize = 5;

    /// Chunks the video decoder may hold before new chunks are dropped
    pub const DEFAULT_MAX_DECODE_QUEUE: usize = 60;

    /// Decode queue lengths worth a diagnostic
    pub const MAX_VIDEO_DECODE_QUEUE_WARN_MS: i64 = 500;
    pub const MAX_AUDIO_DECODE_QUEUE_WARN_MS: i64 = 200;

    /// Video pacer cadence
    pub const PACING_INTERVAL_MS: u64 = 10;

    /// Audio ring size in milliseconds of samples
    pub const DEFAULT_AUDIO_RING_MS: u64 = 1_000;
}
