//! Media units shared by every pipeline stage

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ObjectMapping;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Data,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Data => "data",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded chunk type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    /// Independently decodable, starts a new group on the wire
    Key,
    /// Depends on previous chunks
    Delta,
}

impl ChunkType {
    pub fn is_key(&self) -> bool {
        matches!(self, ChunkType::Key)
    }
}

/// Encoded media unit produced by an encoder
///
/// Immutable once created. Cloning only bumps the payload reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Presentation timestamp in microseconds
    pub timestamp: i64,
    /// Duration in microseconds
    pub duration: i64,
    /// Key or delta
    pub chunk_type: ChunkType,
    /// Encoded bytes
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(timestamp: i64, duration: i64, chunk_type: ChunkType, payload: Bytes) -> Self {
        Self {
            timestamp,
            duration,
            chunk_type,
            payload,
        }
    }

    pub fn key(timestamp: i64, duration: i64, payload: impl Into<Bytes>) -> Self {
        Self::new(timestamp, duration, ChunkType::Key, payload.into())
    }

    pub fn delta(timestamp: i64, duration: i64, payload: impl Into<Bytes>) -> Self {
        Self::new(timestamp, duration, ChunkType::Delta, payload.into())
    }

    /// Duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.duration as f64 / 1000.0
    }
}

/// Encoded chunk tagged with everything the publisher needs to put it on the wire
///
/// This is the message that flows from a capture pipeline into the
/// publisher session.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub media_type: MediaType,
    pub chunk: Chunk,
    /// Sender assigned sequence id. Negative means "send immediately"
    pub seq_id: i64,
    /// Presentation timestamp on the shared A/V timeline
    pub compensated_ts: i64,
    /// Estimated duration from the capture side, -1 when unknown
    pub estimated_duration: i64,
    /// Wall clock of the raw frame capture in milliseconds, 0 when unknown
    pub capture_clock_ms: i64,
    /// Serialized codec configuration, present on key frames or periodically
    pub metadata: Option<Bytes>,
    /// Per message override of the track object mapping
    pub mapping: Option<ObjectMapping>,
}

impl EncodedMessage {
    pub fn new(media_type: MediaType, chunk: Chunk, seq_id: i64) -> Self {
        let compensated_ts = chunk.timestamp;
        Self {
            media_type,
            chunk,
            seq_id,
            compensated_ts,
            estimated_duration: -1,
            capture_clock_ms: 0,
            metadata: None,
            mapping: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Bytes) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Duration written to the wire: the capture estimate when valid, the chunk duration otherwise
    pub fn wire_duration(&self) -> i64 {
        if self.estimated_duration < 0 {
            self.chunk.duration
        } else {
            self.estimated_duration
        }
    }
}

/// Current wall clock in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_display() {
        assert_eq!(MediaType::Audio.to_string(), "audio");
        assert_eq!(MediaType::Video.as_str(), "video");
    }

    #[test]
    fn test_wire_duration_fallback() {
        let chunk = Chunk::key(0, 20_000, vec![1u8, 2, 3]);
        let mut msg = EncodedMessage::new(MediaType::Audio, chunk, 0);
        assert_eq!(msg.wire_duration(), 20_000);

        msg.estimated_duration = 21_333;
        assert_eq!(msg.wire_duration(), 21_333);
    }
}
