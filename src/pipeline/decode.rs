//! Receive side: received object to decoded frame
//!
//! Objects go through the jitter buffer first. Released chunks then pass the
//! decoder gates: configuration, key-frame wait after a discontinuity (video),
//! decode-queue cap (video) and timestamp compensation (audio).

use bytes::Bytes;
use serde::Serialize;

use crate::codec::{CaptureFrame, MediaDecoder};
use crate::constants::{MAX_AUDIO_DECODE_QUEUE_WARN_MS, MAX_VIDEO_DECODE_QUEUE_WARN_MS};
use crate::error::CodecError;
use crate::events::{DropEvent, DropReason, EventSink};
use crate::media::MediaType;
use crate::network::{JitterBuffer, JitterStats, ReceivedObject, Released};
use crate::timing::{PtsQueue, QueueLengthInfo, TimeCorrelationIndex, TimingRecord};

/// Carried through the jitter buffer next to each chunk
#[derive(Debug, Clone)]
struct ChunkInfo {
    capture_clock_ms: i64,
    metadata: Option<Bytes>,
}

/// A decoded frame ready for the render side
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOutput<F> {
    pub frame: F,
    /// Capture wall clock of the chunk the frame came from, 0 when unknown
    pub capture_clock_ms: i64,
    /// Audio gap compensation accumulated so far, in microseconds
    pub timestamp_compensation_offset: i64,
    pub decode_queue: QueueLengthInfo,
}

/// Decode pipeline statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeStats {
    pub media_type: MediaType,
    pub jitter: JitterStats,
    pub decode_queue: QueueLengthInfo,
    pub chunks_decoded: u64,
    pub chunks_dropped: u64,
    pub timestamp_compensation_offset: i64,
    pub waiting_for_key_frame: bool,
}

/// Drives one decoder for one subscribed track
pub struct DecodePipeline<D: MediaDecoder> {
    media_type: MediaType,
    decoder: D,
    jitter: JitterBuffer<ChunkInfo>,
    pts_queue: PtsQueue,
    clocks: TimeCorrelationIndex,
    max_queued_chunks: usize,
    waiting_for_key_frame: bool,
    timestamp_offset: i64,
    last_chunk_end: Option<i64>,
    chunks_decoded: u64,
    chunks_dropped: u64,
    stopped: bool,
    events: EventSink,
}

impl<D> DecodePipeline<D>
where
    D: MediaDecoder,
    D::Output: CaptureFrame,
{
    pub fn new(
        media_type: MediaType,
        decoder: D,
        jitter_buffer_ms: f64,
        max_queued_chunks: usize,
        events: EventSink,
    ) -> Self {
        Self {
            media_type,
            decoder,
            jitter: JitterBuffer::new(media_type, jitter_buffer_ms, events.clone()),
            pts_queue: PtsQueue::new(),
            clocks: TimeCorrelationIndex::new(),
            max_queued_chunks: max_queued_chunks.max(1),
            waiting_for_key_frame: true,
            timestamp_offset: 0,
            last_chunk_end: None,
            chunks_decoded: 0,
            chunks_dropped: 0,
            stopped: false,
            events,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Feed one received object and collect the frames decoded so far
    ///
    /// Decoder errors are returned after the remaining released chunks have
    /// been processed; the first one wins.
    pub fn push(&mut self, object: ReceivedObject) -> Result<Vec<DecodedOutput<D::Output>>, CodecError> {
        if self.stopped {
            tracing::warn!(media = %self.media_type, seq_id = object.packet.seq_id, "Object after stop ignored");
            return Ok(Vec::new());
        }

        let packet = object.packet;
        let info = ChunkInfo {
            capture_clock_ms: packet.capture_clock_ms,
            metadata: packet.metadata.clone(),
        };
        let released = self.jitter.add_item(packet.to_chunk(), packet.seq_id, info);

        let mut first_error = None;
        for item in released {
            if let Err(e) = self.process_released(item) {
                tracing::warn!(media = %self.media_type, "Decode failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let outputs = self.drain();
        match first_error {
            Some(e) if outputs.is_empty() => Err(e),
            _ => Ok(outputs),
        }
    }

    /// Change the jitter buffer target
    pub fn update_jitter_buffer_ms(&mut self, buffer_size_ms: f64) {
        self.jitter.update_max_size(buffer_size_ms);
    }

    /// Flush and close the decoder, then reset every queue
    ///
    /// Frames that were still inside the decoder are returned. Calling it
    /// again returns nothing.
    pub fn stop(&mut self) -> Vec<DecodedOutput<D::Output>> {
        if self.stopped {
            return Vec::new();
        }
        if let Err(e) = self.decoder.flush() {
            tracing::warn!(media = %self.media_type, "Decoder flush failed: {}", e);
        }
        let outputs = self.drain();
        self.decoder.close();
        self.jitter.clear();
        self.pts_queue.clear();
        self.clocks.clear();
        self.timestamp_offset = 0;
        self.last_chunk_end = None;
        self.stopped = true;
        tracing::info!(media = %self.media_type, decoded = self.chunks_decoded, "Decode pipeline stopped");
        outputs
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            media_type: self.media_type,
            jitter: self.jitter.stats(),
            decode_queue: self.pts_queue.length_info(),
            chunks_decoded: self.chunks_decoded,
            chunks_dropped: self.chunks_dropped,
            timestamp_compensation_offset: self.timestamp_offset,
            waiting_for_key_frame: self.waiting_for_key_frame,
        }
    }

    fn drop_chunk(&mut self, item: &Released<ChunkInfo>, reason: DropReason) {
        self.chunks_dropped += 1;
        self.events.drop_event(
            DropEvent::new(self.media_type, reason)
                .with_seq_id(item.seq_id)
                .with_timestamp(item.chunk.timestamp),
        );
    }

    fn process_released(&mut self, item: Released<ChunkInfo>) -> Result<(), CodecError> {
        if item.repeated_or_backwards {
            self.drop_chunk(&item, DropReason::RepeatedOrBackwards);
            return Ok(());
        }

        if !self.decoder.is_configured() {
            if let Some(metadata) = &item.extra.metadata {
                self.decoder.configure(metadata)?;
                self.waiting_for_key_frame = true;
                tracing::info!(media = %self.media_type, seq_id = item.seq_id, "Decoder configured");
            }
        }
        if !self.decoder.is_configured() {
            self.drop_chunk(&item, DropReason::DecoderNotConfigured);
            return Ok(());
        }

        let ts = item.chunk.timestamp;
        let duration = item.chunk.duration;
        match self.media_type {
            MediaType::Video => {
                if self.decoder.queue_size() >= self.max_queued_chunks {
                    self.drop_chunk(&item, DropReason::DecoderQueueFull);
                    return Ok(());
                }
                if item.is_disco {
                    tracing::warn!(seq_id = item.seq_id, "Video discontinuity, waiting for key frame");
                    self.waiting_for_key_frame = true;
                }
                if self.waiting_for_key_frame && !item.chunk.chunk_type.is_key() {
                    self.drop_chunk(&item, DropReason::WaitingForKeyframe);
                    return Ok(());
                }
                self.waiting_for_key_frame = false;
            }
            _ => {
                if item.is_disco {
                    if let Some(end) = self.last_chunk_end {
                        self.timestamp_offset += ts - end;
                        tracing::debug!(
                            media = %self.media_type,
                            seq_id = item.seq_id,
                            offset = self.timestamp_offset,
                            "Discontinuity, timestamp compensation updated"
                        );
                    }
                }
                self.last_chunk_end = Some(ts + duration);
            }
        }

        self.pts_queue.remove_until(self.decoder.queue_size());
        self.pts_queue.add(ts, duration);
        self.clocks.add_item(TimingRecord {
            ts,
            compensated_ts: ts,
            estimated_duration: duration,
            capture_clock_ms: item.extra.capture_clock_ms,
        });

        let queue = self.pts_queue.length_info();
        let warn_ms = match self.media_type {
            MediaType::Video => MAX_VIDEO_DECODE_QUEUE_WARN_MS,
            _ => MAX_AUDIO_DECODE_QUEUE_WARN_MS,
        };
        if queue.length_ms > warn_ms {
            tracing::debug!(media = %self.media_type, length_ms = queue.length_ms, "Decode queue is long");
        }

        self.decoder.decode(item.chunk)?;
        self.chunks_decoded += 1;
        Ok(())
    }

    fn drain(&mut self) -> Vec<DecodedOutput<D::Output>> {
        let mut outputs = Vec::new();
        while let Some(frame) = self.decoder.poll_output() {
            self.pts_queue.remove_until(self.decoder.queue_size());
            let capture_clock_ms = self
                .clocks
                .get_item_by_ts(frame.timestamp(), false)
                .map(|record| record.capture_clock_ms)
                .unwrap_or(0);
            outputs.push(DecodedOutput {
                frame,
                capture_clock_ms,
                timestamp_compensation_offset: self.timestamp_offset,
                decode_queue: self.pts_queue.length_info(),
            });
        }
        outputs
    }
}
