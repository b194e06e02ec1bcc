//! Lock-free ring buffer for decoded audio samples
//!
//! This implements a single-producer single-consumer (SPSC) ring between the
//! decode pipeline and the real-time audio rendering context.
//!
//! Memory ordering:
//! - the producer writes samples, then stores `end` with `Release`
//! - the consumer loads `end` with `Acquire`, reads samples, then stores
//!   `start` with `Release`
//! - the producer loads `start` with `Acquire` before computing free space
//!
//! `start` is written only by the consumer and `end` only by the producer.
//! Neither side ever blocks, spins or takes a lock.

use crossbeam::utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::MAX_ITEMS_IN_TS_INDEX;
use crate::error::BufferError;
use crate::events::{DropEvent, DropReason, EventSink};
use crate::media::MediaType;

/// Decoded audio frame containing interleaved samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved audio samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Timestamp in microseconds
    pub timestamp: i64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32, timestamp: i64) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            timestamp,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples_per_channel() as i64 * 1_000_000) / self.sample_rate as i64
    }
}

/// Shared state between producer and consumer
struct RingShared {
    /// One plane per channel, f32 stored as bits
    planes: Vec<Box<[AtomicU32]>>,
    /// Slots per plane; one more than the capacity so full and empty differ
    slots: usize,
    sample_rate: u32,
    /// Read position. Only modified by the consumer
    start: CachePadded<AtomicUsize>,
    /// Write position. Only modified by the producer
    end: CachePadded<AtomicUsize>,
    inserted_silence_ms: AtomicU64,
    is_playing: AtomicBool,
    /// Set when the producer side is cleared; the consumer then reads nothing
    detached: AtomicBool,
}

impl RingShared {
    fn capacity(&self) -> usize {
        self.slots - 1
    }

    fn used_slots(&self, start: usize, end: usize) -> usize {
        if end >= start {
            end - start
        } else {
            self.slots - start + end
        }
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RingStats {
    /// Timestamp of the sample the consumer is at, in microseconds
    pub current_timestamp: Option<i64>,
    /// Buffered samples per channel
    pub queue_size: usize,
    pub queue_length_ms: i64,
    pub total_silence_inserted_ms: u64,
    pub is_playing: bool,
}

/// Producer side of the audio ring, owned by the decode pipeline
pub struct CircularAudioBuffer {
    shared: Option<Arc<RingShared>>,
    /// `(sample index, timestamp)` of the first sample of each pushed frame
    sample_index: VecDeque<(usize, i64)>,
    last_timestamp: Option<i64>,
    events: EventSink,
}

impl CircularAudioBuffer {
    /// Create an uninitialized buffer
    pub fn new(events: EventSink) -> Self {
        Self {
            shared: None,
            sample_index: VecDeque::new(),
            last_timestamp: None,
            events,
        }
    }

    /// Allocate the ring and return the consumer handle
    ///
    /// Can only be called once until [`clear`](Self::clear).
    pub fn init(
        &mut self,
        num_channels: usize,
        num_samples: usize,
        sample_rate: u32,
    ) -> Result<AudioConsumer, BufferError> {
        if self.shared.is_some() {
            return Err(BufferError::AlreadyInitialized);
        }
        if num_channels == 0 {
            return Err(BufferError::InvalidArgument("numChannels must be > 0".into()));
        }
        if num_samples == 0 {
            return Err(BufferError::InvalidArgument("numSamples must be > 0".into()));
        }
        if sample_rate == 0 {
            return Err(BufferError::InvalidArgument("sampleRate must be > 0".into()));
        }

        let slots = num_samples + 1;
        let planes = (0..num_channels)
            .map(|_| {
                (0..slots)
                    .map(|_| AtomicU32::new(0.0f32.to_bits()))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();

        let shared = Arc::new(RingShared {
            planes,
            slots,
            sample_rate,
            start: CachePadded::new(AtomicUsize::new(0)),
            end: CachePadded::new(AtomicUsize::new(0)),
            inserted_silence_ms: AtomicU64::new(0),
            is_playing: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        });
        self.shared = Some(shared.clone());
        self.sample_index.clear();
        self.last_timestamp = None;

        tracing::debug!(num_channels, num_samples, sample_rate, "Audio ring initialized");
        Ok(AudioConsumer { shared })
    }

    /// Check if the ring is allocated
    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    /// Copy a frame into the ring
    ///
    /// Returns `Ok(false)` when there is not enough free space; the frame is
    /// dropped whole and a drop event emitted. Never blocks and never
    /// writes part of a frame.
    pub fn try_push(&mut self, frame: &AudioFrame, override_ts: Option<i64>) -> Result<bool, BufferError> {
        let shared = self.shared.as_ref().ok_or(BufferError::NotInitialized)?;
        let timestamp = override_ts.unwrap_or(frame.timestamp);

        if frame.channels as usize != shared.planes.len() {
            return Err(BufferError::FormatMismatch(format!(
                "expected {} channels, got {}",
                shared.planes.len(),
                frame.channels
            )));
        }
        if frame.sample_rate != shared.sample_rate {
            return Err(BufferError::FormatMismatch(format!(
                "expected {} Hz, got {} Hz",
                shared.sample_rate, frame.sample_rate
            )));
        }

        let to_add = frame.samples_per_channel();
        let start = shared.start.load(Ordering::Acquire);
        let end = shared.end.load(Ordering::Relaxed);
        let free = shared.capacity() - shared.used_slots(start, end);

        if to_add > free {
            self.events.drop_event(
                DropEvent::new(MediaType::Audio, DropReason::RingBufferFull).with_timestamp(timestamp),
            );
            return Ok(false);
        }

        while self.sample_index.len() >= MAX_ITEMS_IN_TS_INDEX {
            self.sample_index.pop_front();
        }
        self.sample_index.push_back((end, timestamp));

        // Split at the wrap boundary
        let first_half = to_add.min(shared.slots - end);
        let channels = shared.planes.len();
        for (c, plane) in shared.planes.iter().enumerate() {
            for i in 0..first_half {
                plane[end + i].store(frame.samples[i * channels + c].to_bits(), Ordering::Relaxed);
            }
            for i in first_half..to_add {
                plane[i - first_half].store(frame.samples[i * channels + c].to_bits(), Ordering::Relaxed);
            }
        }

        shared.end.store((end + to_add) % shared.slots, Ordering::Release);
        Ok(true)
    }

    /// Get statistics, prunes index entries the consumer has passed
    pub fn stats(&mut self) -> Result<RingStats, BufferError> {
        let shared = self.shared.as_ref().ok_or(BufferError::NotInitialized)?;
        let start = shared.start.load(Ordering::Acquire);
        let end = shared.end.load(Ordering::Acquire);
        let used = shared.used_slots(start, end);

        // Newest frame whose first sample the consumer has reached
        let mut found = None;
        for (n, (index, _)) in self.sample_index.iter().enumerate() {
            let ahead = (index + shared.slots - start) % shared.slots;
            if ahead == 0 || ahead >= used {
                found = Some(n);
            } else {
                break;
            }
        }
        if let Some(n) = found {
            let (index, ts) = self.sample_index[n];
            let extra_samples = (start + shared.slots - index) % shared.slots;
            self.last_timestamp =
                Some(ts + (extra_samples as i64 * 1_000_000) / shared.sample_rate as i64);
            self.sample_index.drain(..n);
        }

        Ok(RingStats {
            current_timestamp: self.last_timestamp,
            queue_size: used,
            queue_length_ms: (used as i64 * 1000) / shared.sample_rate as i64,
            total_silence_inserted_ms: shared.inserted_silence_ms.load(Ordering::Relaxed),
            is_playing: shared.is_playing.load(Ordering::Relaxed),
        })
    }

    /// Capacity in samples per channel
    pub fn capacity(&self) -> Option<usize> {
        self.shared.as_ref().map(|s| s.capacity())
    }

    pub fn play(&self) {
        if let Some(shared) = &self.shared {
            shared.is_playing.store(true, Ordering::Relaxed);
        }
    }

    pub fn stop(&self) {
        if let Some(shared) = &self.shared {
            shared.is_playing.store(false, Ordering::Relaxed);
        }
    }

    /// Return to the uninitialized state; the consumer handle goes silent
    pub fn clear(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.is_playing.store(false, Ordering::Relaxed);
            shared.detached.store(true, Ordering::Release);
        }
        self.sample_index.clear();
        self.last_timestamp = None;
    }
}

/// Consumer side of the audio ring, owned by the rendering context
pub struct AudioConsumer {
    shared: Arc<RingShared>,
}

impl AudioConsumer {
    /// Read up to `out[c].len()` samples per channel; returns samples read per channel
    pub fn try_pop(&mut self, out: &mut [Vec<f32>]) -> usize {
        let s = &self.shared;
        if s.detached.load(Ordering::Acquire) || out.is_empty() {
            return 0;
        }

        let end = s.end.load(Ordering::Acquire);
        let start = s.start.load(Ordering::Relaxed);
        let wanted = out.iter().map(|o| o.len()).min().unwrap_or(0);
        let n = wanted.min(s.used_slots(start, end));
        if n == 0 {
            return 0;
        }

        for (c, plane) in s.planes.iter().enumerate() {
            let Some(dst) = out.get_mut(c) else {
                break;
            };
            for (i, sample) in dst.iter_mut().take(n).enumerate() {
                *sample = f32::from_bits(plane[(start + i) % s.slots].load(Ordering::Relaxed));
            }
        }

        s.start.store((start + n) % s.slots, Ordering::Release);
        n
    }

    /// Report silence the renderer inserted because the ring ran dry
    pub fn insert_silence_ms(&self, ms: u64) {
        self.shared.inserted_silence_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.is_playing.load(Ordering::Relaxed) && !self.shared.detached.load(Ordering::Acquire)
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.shared.planes.len()
    }

    /// Get fill level in samples per channel
    pub fn available(&self) -> usize {
        let end = self.shared.end.load(Ordering::Acquire);
        let start = self.shared.start.load(Ordering::Relaxed);
        self.shared.used_slots(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use proptest::prelude::*;

    /// Stereo frame whose left channel counts up from `first`, right is negated
    fn frame(first: usize, len: usize, ts: i64) -> AudioFrame {
        let mut samples = Vec::with_capacity(len * 2);
        for i in 0..len {
            let v = (first + i) as f32;
            samples.push(v);
            samples.push(-v);
        }
        AudioFrame::new(samples, 2, 48_000, ts)
    }

    #[test]
    fn test_init_errors() {
        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        assert!(matches!(ring.init(0, 10, 48_000), Err(BufferError::InvalidArgument(_))));
        assert!(matches!(ring.init(2, 0, 48_000), Err(BufferError::InvalidArgument(_))));
        assert!(ring.init(2, 10, 48_000).is_ok());
        assert!(matches!(ring.init(2, 10, 48_000), Err(BufferError::AlreadyInitialized)));
    }

    #[test]
    fn test_push_pop_wraps() {
        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        let mut consumer = ring.init(2, 8, 48_000).unwrap();

        assert!(ring.try_push(&frame(0, 6, 0), None).unwrap());
        let mut out = vec![vec![0.0; 4]; 2];
        assert_eq!(consumer.try_pop(&mut out), 4);
        assert_eq!(out[0], vec![0.0, 1.0, 2.0, 3.0]);

        // Crosses the end of the planes
        assert!(ring.try_push(&frame(6, 6, 125), None).unwrap());
        let mut out = vec![vec![0.0; 8]; 2];
        assert_eq!(consumer.try_pop(&mut out), 8);
        assert_eq!(out[0], (4..12).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(out[1][0], -4.0);
    }

    #[test]
    fn test_full_ring_drops_whole_frame() {
        let (events, rx) = EventSink::bounded(4);
        let mut ring = CircularAudioBuffer::new(events);
        let consumer = ring.init(2, 10, 48_000).unwrap();

        assert!(ring.try_push(&frame(0, 10, 0), None).unwrap());
        assert_eq!(consumer.available(), 10);
        assert!(!ring.try_push(&frame(10, 1, 99), None).unwrap());
        assert_eq!(consumer.available(), 10);

        match rx.try_recv().unwrap() {
            PipelineEvent::Dropped(e) => {
                assert_eq!(e.reason, DropReason::RingBufferFull);
                assert_eq!(e.timestamp, Some(99));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_format_mismatch() {
        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        ring.init(1, 10, 48_000).unwrap();
        assert!(matches!(
            ring.try_push(&frame(0, 2, 0), None),
            Err(BufferError::FormatMismatch(_))
        ));

        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        ring.init(2, 10, 44_100).unwrap();
        assert!(matches!(
            ring.try_push(&frame(0, 2, 0), None),
            Err(BufferError::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_stats_tracks_consumed_timestamp() {
        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        let mut consumer = ring.init(2, 48_000, 48_000).unwrap();

        // Two 10ms frames
        ring.try_push(&frame(0, 480, 1_000_000), None).unwrap();
        ring.try_push(&frame(480, 480, 0), Some(1_010_000)).unwrap();

        let mut out = vec![vec![0.0; 720]; 2];
        assert_eq!(consumer.try_pop(&mut out), 720);

        let stats = ring.stats().unwrap();
        // Consumer is 240 samples (5ms) into the second frame
        assert_eq!(stats.current_timestamp, Some(1_015_000));
        assert_eq!(stats.queue_size, 240);
        assert_eq!(stats.queue_length_ms, 5);

        consumer.insert_silence_ms(20);
        ring.play();
        let stats = ring.stats().unwrap();
        assert_eq!(stats.total_silence_inserted_ms, 20);
        assert!(stats.is_playing);
        assert!(consumer.is_playing());
    }

    #[test]
    fn test_clear_detaches_consumer() {
        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        let mut consumer = ring.init(2, 16, 48_000).unwrap();
        ring.try_push(&frame(0, 4, 0), None).unwrap();

        ring.clear();
        ring.clear();
        assert!(!ring.is_initialized());
        assert!(matches!(ring.stats(), Err(BufferError::NotInitialized)));

        let mut out = vec![vec![0.0; 4]; 2];
        assert_eq!(consumer.try_pop(&mut out), 0);
        assert!(ring.init(2, 16, 48_000).is_ok());
    }

    #[test]
    fn test_threaded_fifo() {
        let mut ring = CircularAudioBuffer::new(EventSink::disabled());
        let mut consumer = ring.init(2, 256, 48_000).unwrap();
        const TOTAL: usize = 20_000;

        let reader = std::thread::spawn(move || {
            let mut next = 0usize;
            let mut out = vec![vec![0.0; 64]; 2];
            while next < TOTAL {
                let n = consumer.try_pop(&mut out);
                for i in 0..n {
                    assert_eq!(out[0][i], next as f32);
                    assert_eq!(out[1][i], -(next as f32));
                    next += 1;
                }
                if n == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut written = 0;
        while written < TOTAL {
            let len = 48.min(TOTAL - written);
            if ring.try_push(&frame(written, len, 0), None).unwrap() {
                written += len;
            } else {
                std::thread::yield_now();
            }
        }
        reader.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_capacity_invariant(ops in proptest::collection::vec((any::<bool>(), 1usize..40), 1..200)) {
            let capacity = 64;
            let mut ring = CircularAudioBuffer::new(EventSink::disabled());
            let mut consumer = ring.init(2, capacity, 48_000).unwrap();
            let mut model = VecDeque::new();
            let mut counter = 0usize;

            for (push, len) in ops {
                if push {
                    let free = capacity - model.len();
                    let accepted = ring.try_push(&frame(counter, len, 0), None).unwrap();
                    prop_assert_eq!(accepted, len <= free);
                    if accepted {
                        model.extend(counter..counter + len);
                        counter += len;
                    }
                } else {
                    let mut out = vec![vec![0.0; len]; 2];
                    let n = consumer.try_pop(&mut out);
                    prop_assert_eq!(n, len.min(model.len()));
                    for value in out[0].iter().take(n) {
                        prop_assert_eq!(*value, model.pop_front().unwrap() as f32);
                    }
                }
                prop_assert!(consumer.available() <= capacity);
                prop_assert_eq!(consumer.available(), model.len());
            }
        }
    }
}
