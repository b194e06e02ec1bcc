//! Video render pacing
//!
//! The pacer owns the render buffer. Decoded frames arrive over a bounded
//! channel; every tick the pacer picks the frame for "now" and hands it to the
//! renderer over a second bounded channel.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RenderConfig;
use crate::events::{DropEvent, DropReason, EventSink};
use crate::media::MediaType;
use crate::video::{RenderFrame, VideoRenderBuffer};

const NO_TIMESTAMP: i64 = i64::MIN;

/// Presentation time of the audio currently playing, shared with the pacer
#[derive(Debug, Clone)]
pub struct PlaybackClock(Arc<AtomicI64>);

impl PlaybackClock {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(NO_TIMESTAMP)))
    }

    pub fn set(&self, timestamp: i64) {
        self.0.store(timestamp, Ordering::Release);
    }

    /// Forget the timestamp, e.g. when audio playback stops
    pub fn reset(&self) {
        self.0.store(NO_TIMESTAMP, Ordering::Release);
    }

    pub fn get(&self) -> Option<i64> {
        match self.0.load(Ordering::Acquire) {
            NO_TIMESTAMP => None,
            ts => Some(ts),
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame handed to the renderer
#[derive(Debug)]
pub struct RenderedFrame<F> {
    pub frame: F,
    pub capture_clock_ms: i64,
    /// Frames left in the render buffer
    pub queue_size: usize,
    pub queue_length_ms: f64,
    /// Frames discarded by the selection that picked this one
    pub discarded: usize,
}

/// Pacer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PacerStats {
    pub frames_rendered: u64,
    pub frames_dropped: u64,
    pub total_discarded: u64,
    pub queue_size: usize,
    pub queue_length_ms: f64,
}

/// Sending side feeding decoded frames to a [`VideoPacer`]
#[derive(Debug)]
pub struct PacerInput<F> {
    tx: mpsc::Sender<(F, i64)>,
    events: EventSink,
}

impl<F> Clone for PacerInput<F> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            events: self.events.clone(),
        }
    }
}

impl<F: RenderFrame> PacerInput<F> {
    /// Queue a decoded frame; when the queue is full the frame is released
    pub fn push(&self, frame: F, capture_clock_ms: i64) -> bool {
        match self.tx.try_send((frame, capture_clock_ms)) {
            Ok(()) => true,
            Err(TrySendError::Full((frame, _))) | Err(TrySendError::Closed((frame, _))) => {
                let ts = frame.timestamp();
                frame.release();
                self.events
                    .drop_event(DropEvent::new(MediaType::Video, DropReason::RenderBufferFull).with_timestamp(ts));
                false
            }
        }
    }
}

/// Selects the frame to render at a fixed cadence
///
/// With a [`PlaybackClock`] that has a timestamp the newest frame not after
/// the audio position is picked and older ones are discarded. Without one the
/// oldest frame is taken on every tick.
pub struct VideoPacer<F: RenderFrame> {
    buffer: VideoRenderBuffer<F>,
    input: mpsc::Receiver<(F, i64)>,
    output: mpsc::Sender<RenderedFrame<F>>,
    clock: Option<PlaybackClock>,
    interval: Duration,
    stats: PacerStats,
    events: EventSink,
}

impl<F: RenderFrame> VideoPacer<F> {
    /// Create a pacer with its input handle and the renderer's receiving side
    pub fn new(
        config: &RenderConfig,
        clock: Option<PlaybackClock>,
        events: EventSink,
    ) -> (Self, PacerInput<F>, mpsc::Receiver<RenderedFrame<F>>) {
        let capacity = config.buffer_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let pacer = Self {
            buffer: VideoRenderBuffer::with_capacity(capacity),
            input: input_rx,
            output: output_tx,
            clock,
            interval: config.pacing_interval(),
            stats: PacerStats::default(),
            events: events.clone(),
        };
        let input = PacerInput { tx: input_tx, events };
        (pacer, input, output_rx)
    }

    /// One pacing step; returns true when a frame was handed to the renderer
    pub fn tick(&mut self) -> bool {
        while let Ok((frame, capture_clock_ms)) = self.input.try_recv() {
            if let Err(frame) = self.buffer.add_item(frame, capture_clock_ms) {
                self.release_dropped(frame);
            }
        }

        let selection = match self.clock.as_ref().and_then(PlaybackClock::get) {
            Some(audio_ts) => self.buffer.get_item_by_ts(audio_ts),
            None => self.buffer.get_first_element(),
        };
        self.stats.total_discarded = selection.total_discarded;
        self.stats.queue_size = selection.queue_size;
        self.stats.queue_length_ms = selection.queue_length_ms;
        if selection.discarded > 0 {
            tracing::debug!(discarded = selection.discarded, "Late video frames discarded");
        }

        let Some(frame) = selection.frame else {
            return false;
        };
        let rendered = RenderedFrame {
            frame,
            capture_clock_ms: selection.capture_clock_ms.unwrap_or(0),
            queue_size: selection.queue_size,
            queue_length_ms: selection.queue_length_ms,
            discarded: selection.discarded,
        };
        match self.output.try_send(rendered) {
            Ok(()) => {
                self.stats.frames_rendered += 1;
                true
            }
            Err(TrySendError::Full(rendered)) | Err(TrySendError::Closed(rendered)) => {
                self.release_dropped(rendered.frame);
                false
            }
        }
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    /// Tick until cancelled, then release everything still buffered
    pub async fn run(mut self, cancel: CancellationToken) -> PacerStats {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Video pacer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        self.input.close();
        while let Ok((frame, _)) = self.input.try_recv() {
            frame.release();
        }
        self.buffer.clear();
        tracing::info!(rendered = self.stats.frames_rendered, "Video pacer stopped");
        self.stats
    }

    fn release_dropped(&mut self, frame: F) {
        let ts = frame.timestamp();
        frame.release();
        self.stats.frames_dropped += 1;
        self.events
            .drop_event(DropEvent::new(MediaType::Video, DropReason::RenderBufferFull).with_timestamp(ts));
    }
}
