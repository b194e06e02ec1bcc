//! Structured pipeline events
//!
//! Every per-item drop in the system is reported here instead of being
//! logged ad hoc. Consumers (stats view, tests) drain the receiving side.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::fmt;

use crate::media::{now_ms, MediaType};

/// Why an item was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Per track in-flight request cap reached for a subscriber
    InFlightLimit,
    /// Arrived after the jitter buffer already released a newer item
    LateArrival,
    /// Not enough free space in the audio ring
    RingBufferFull,
    /// Render buffer at capacity
    RenderBufferFull,
    /// Encoder queue above its limit
    EncoderQueueFull,
    /// Decoder queue above its limit
    DecoderQueueFull,
    /// Delta chunk while waiting for a key frame
    WaitingForKeyframe,
    /// Sequence id not newer than the last one delivered
    RepeatedOrBackwards,
    /// Received objects channel full
    ReceiveQueueFull,
    /// Decoder not configured yet
    DecoderNotConfigured,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::InFlightLimit => "in-flight limit",
            DropReason::LateArrival => "late arrival",
            DropReason::RingBufferFull => "ring buffer full",
            DropReason::RenderBufferFull => "render buffer full",
            DropReason::EncoderQueueFull => "encoder queue full",
            DropReason::DecoderQueueFull => "decoder queue full",
            DropReason::WaitingForKeyframe => "waiting for keyframe",
            DropReason::RepeatedOrBackwards => "repeated or backwards",
            DropReason::ReceiveQueueFull => "receive queue full",
            DropReason::DecoderNotConfigured => "decoder not configured",
        };
        f.write_str(name)
    }
}

/// One dropped item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropEvent {
    /// Wall clock when the drop happened
    pub clock_ms: i64,
    pub media_type: MediaType,
    pub reason: DropReason,
    pub seq_id: Option<i64>,
    /// Media timestamp of the dropped item in microseconds
    pub timestamp: Option<i64>,
    /// Oldest sequence id still buffered, for late arrivals
    pub first_buffered_seq_id: Option<i64>,
}

impl DropEvent {
    pub fn new(media_type: MediaType, reason: DropReason) -> Self {
        Self {
            clock_ms: now_ms(),
            media_type,
            reason,
            seq_id: None,
            timestamp: None,
            first_buffered_seq_id: None,
        }
    }

    pub fn with_seq_id(mut self, seq_id: i64) -> Self {
        self.seq_id = Some(seq_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_first_buffered(mut self, seq_id: Option<i64>) -> Self {
        self.first_buffered_seq_id = seq_id;
        self
    }
}

/// Everything the core reports to the embedding application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Dropped(DropEvent),
    SessionRunning { role: &'static str },
    SessionClosed { role: &'static str, reason: String },
}

/// Non-blocking sending side of the event channel
///
/// When the channel is full the event is discarded: reporting must never
/// stall a media path.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    /// Create a sink with a bounded channel
    pub fn bounded(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("Event channel full, event discarded");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn drop_event(&self, event: DropEvent) {
        tracing::debug!(
            media = %event.media_type,
            reason = %event.reason,
            seq_id = ?event.seq_id,
            "Dropped item"
        );
        self.emit(PipelineEvent::Dropped(event));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::disabled()
    }
}
