//! Capture side: raw frame to sequenced, timeline compensated message
//!
//! Each raw frame gets a compensated timestamp from the shared A/V origin and
//! a timing record before it reaches the encoder. Encoder output is matched
//! back to its record (nearest past), numbered and handed to the publisher.

use bytes::Bytes;
use serde::Serialize;

use crate::codec::{CaptureFrame, EncodedOutput, MediaEncoder};
use crate::config::CaptureConfig;
use crate::error::CodecError;
use crate::events::{DropEvent, DropReason, EventSink};
use crate::media::{now_ms, EncodedMessage, MediaType};
use crate::timing::{SyncOffsetCoordinator, TimeCorrelationIndex, TimingRecord};

/// Capture pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    pub chunks_emitted: u64,
    pub encoder_queue_size: usize,
}

/// Drives one encoder for one track
pub struct CapturePipeline<E: MediaEncoder> {
    media_type: MediaType,
    encoder: E,
    sync: SyncOffsetCoordinator,
    time_index: TimeCorrelationIndex,
    config: CaptureConfig,
    next_seq_id: i64,
    force_key_frame: bool,
    last_metadata: Option<Bytes>,
    stats: CaptureStats,
    events: EventSink,
}

impl<E: MediaEncoder> CapturePipeline<E> {
    /// Wrap a configured encoder
    pub fn new(
        media_type: MediaType,
        encoder: E,
        sync: SyncOffsetCoordinator,
        config: CaptureConfig,
        events: EventSink,
    ) -> Self {
        Self {
            media_type,
            encoder,
            sync,
            time_index: TimeCorrelationIndex::new(),
            config,
            next_seq_id: 0,
            force_key_frame: false,
            last_metadata: None,
            stats: CaptureStats::default(),
            events,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Process one captured frame and return whatever the encoder produced
    ///
    /// A frame arriving while the encoder holds more than
    /// `encoder_max_queue_size` frames is released unencoded. For video the
    /// next encoded frame is then forced to be a key frame.
    pub fn process_frame(&mut self, frame: E::Frame) -> Result<Vec<EncodedMessage>, CodecError> {
        let ts = frame.timestamp();
        let synced = self.sync.process(ts);
        self.time_index.add_item(TimingRecord {
            ts,
            compensated_ts: synced.compensated_ts,
            estimated_duration: synced.estimated_duration,
            capture_clock_ms: now_ms(),
        });
        self.stats.frames_captured += 1;

        if self.encoder.queue_size() > self.config.encoder_max_queue_size {
            frame.release();
            self.stats.frames_dropped += 1;
            self.events
                .drop_event(DropEvent::new(self.media_type, DropReason::EncoderQueueFull).with_timestamp(ts));
            if self.media_type == MediaType::Video {
                self.force_key_frame = true;
            }
            return Ok(self.drain());
        }

        let key_frame = self.media_type == MediaType::Video
            && (self.force_key_frame || self.stats.frames_encoded % self.config.keyframe_every.max(1) == 0);
        self.encoder.encode(frame, key_frame)?;
        self.force_key_frame = false;
        self.stats.frames_encoded += 1;

        Ok(self.drain())
    }

    /// Push every pending frame through the encoder
    pub fn flush(&mut self) -> Result<Vec<EncodedMessage>, CodecError> {
        self.encoder.flush()?;
        Ok(self.drain())
    }

    pub fn close(&mut self) {
        self.encoder.close();
        self.time_index.clear();
        tracing::info!(media = %self.media_type, "Capture pipeline closed");
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            encoder_queue_size: self.encoder.queue_size(),
            ..self.stats
        }
    }

    fn drain(&mut self) -> Vec<EncodedMessage> {
        let mut messages = Vec::new();
        while let Some(output) = self.encoder.poll_output() {
            messages.push(self.package(output));
        }
        messages
    }

    fn package(&mut self, output: EncodedOutput) -> EncodedMessage {
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.stats.chunks_emitted += 1;

        let metadata = match output.metadata {
            Some(metadata) => {
                self.last_metadata = Some(metadata.clone());
                Some(metadata)
            }
            None if self.media_type == MediaType::Audio
                && seq_id % self.config.metadata_every.max(1) as i64 == 0 =>
            {
                self.last_metadata.clone()
            }
            None => None,
        };

        let timing = self.time_index.get_item_by_ts(output.chunk.timestamp, false);
        let mut msg = EncodedMessage::new(self.media_type, output.chunk, seq_id);
        match timing {
            Some(record) => {
                msg.compensated_ts = record.compensated_ts;
                msg.estimated_duration = record.estimated_duration;
                msg.capture_clock_ms = record.capture_clock_ms;
            }
            None => {
                tracing::debug!(media = %self.media_type, ts = msg.chunk.timestamp, "No timing record for chunk");
                msg.compensated_ts = 0;
                msg.estimated_duration = msg.chunk.duration;
                msg.capture_clock_ms = 0;
            }
        }
        msg.metadata = metadata;
        msg
    }
}
