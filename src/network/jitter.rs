//! Reorder buffer for received chunks
//!
//! Chunks are kept sorted by sender sequence id until the buffered duration
//! reaches the target, then released from the head. Released items are
//! classified against the last in-order sequence id so the decoder can react
//! to discontinuities.

use serde::Serialize;
use std::collections::VecDeque;

use crate::constants::DEFAULT_JITTER_BUFFER_MS;
use crate::events::{DropEvent, DropReason, EventSink};
use crate::media::{Chunk, MediaType};

struct Entry<E> {
    chunk: Chunk,
    seq_id: i64,
    extra: E,
}

/// An item leaving the jitter buffer
#[derive(Debug, Clone)]
pub struct Released<E> {
    pub chunk: Chunk,
    pub seq_id: i64,
    pub extra: E,
    /// Sequence id does not follow the last in-order one
    pub is_disco: bool,
    /// Sequence id not newer than the last in-order one
    pub repeated_or_backwards: bool,
}

/// Jitter buffer statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JitterStats {
    pub num_total_gaps: u64,
    pub num_total_lost_streams: u64,
    pub total_length_ms: f64,
    pub size: usize,
    pub current_max_size_ms: f64,
}

/// Sequence-ordered jitter buffer
///
/// `E` is whatever the caller needs to carry along with each chunk
/// (capture clock, metadata, ...).
pub struct JitterBuffer<E> {
    media_type: MediaType,
    buffer_size_ms: f64,
    items: VecDeque<Entry<E>>,
    total_length_ms: f64,
    num_total_gaps: u64,
    num_total_lost_streams: u64,
    last_correct_seq_id: Option<i64>,
    events: EventSink,
}

impl<E> JitterBuffer<E> {
    /// Create a new jitter buffer; a non-positive size selects the default
    pub fn new(media_type: MediaType, buffer_size_ms: f64, events: EventSink) -> Self {
        let buffer_size_ms = if buffer_size_ms > 0.0 {
            buffer_size_ms
        } else {
            DEFAULT_JITTER_BUFFER_MS as f64
        };
        Self {
            media_type,
            buffer_size_ms,
            items: VecDeque::new(),
            total_length_ms: 0.0,
            num_total_gaps: 0,
            num_total_lost_streams: 0,
            last_correct_seq_id: None,
            events,
        }
    }

    /// Add a chunk and return whatever the buffer releases as a result
    pub fn add_item(&mut self, chunk: Chunk, seq_id: i64, extra: E) -> Vec<Released<E>> {
        match self.items.front() {
            None => self.push(chunk, seq_id, extra, 0),
            Some(head) if seq_id <= head.seq_id => {
                let first_buffered = head.seq_id;
                self.events.drop_event(
                    DropEvent::new(self.media_type, DropReason::LateArrival)
                        .with_seq_id(seq_id)
                        .with_timestamp(chunk.timestamp)
                        .with_first_buffered(Some(first_buffered)),
                );
            }
            Some(_) => {
                // Equal ids keep arrival order
                let index = self.items.partition_point(|e| e.seq_id <= seq_id);
                self.push(chunk, seq_id, extra, index);
            }
        }

        let mut released = Vec::new();
        while self.total_length_ms >= self.buffer_size_ms {
            match self.pop() {
                Some(item) => released.push(item),
                None => break,
            }
        }
        released
    }

    fn push(&mut self, chunk: Chunk, seq_id: i64, extra: E, index: usize) {
        self.total_length_ms += chunk.duration_ms();
        self.items.insert(index, Entry { chunk, seq_id, extra });
    }

    fn pop(&mut self) -> Option<Released<E>> {
        let Entry { chunk, seq_id, extra } = self.items.pop_front()?;
        self.total_length_ms -= chunk.duration_ms();
        if self.items.is_empty() {
            self.total_length_ms = 0.0;
        }

        let mut is_disco = false;
        let mut repeated_or_backwards = false;
        if seq_id >= 0 {
            match self.last_correct_seq_id {
                None => self.last_correct_seq_id = Some(seq_id),
                Some(last) if last + 1 == seq_id => self.last_correct_seq_id = Some(seq_id),
                Some(last) => {
                    is_disco = true;
                    if seq_id <= last {
                        repeated_or_backwards = true;
                    } else {
                        self.num_total_gaps += 1;
                        self.num_total_lost_streams += seq_id.abs_diff(last);
                        self.last_correct_seq_id = Some(seq_id);
                    }
                }
            }
        }

        Some(Released {
            chunk,
            seq_id,
            extra,
            is_disco,
            repeated_or_backwards,
        })
    }

    /// Change the target buffering; ignored when not positive
    pub fn update_max_size(&mut self, buffer_size_ms: f64) {
        if buffer_size_ms > 0.0 {
            tracing::debug!(media = %self.media_type, buffer_size_ms, "Jitter buffer resized");
            self.buffer_size_ms = buffer_size_ms;
        }
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            num_total_gaps: self.num_total_gaps,
            num_total_lost_streams: self.num_total_lost_streams,
            total_length_ms: self.total_length_ms,
            size: self.items.len(),
            current_max_size_ms: self.buffer_size_ms,
        }
    }

    /// Oldest buffered sequence id
    pub fn first_seq_id(&self) -> Option<i64> {
        self.items.front().map(|e| e.seq_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop everything and reset counters
    pub fn clear(&mut self) {
        self.items.clear();
        self.total_length_ms = 0.0;
        self.num_total_gaps = 0;
        self.num_total_lost_streams = 0;
        self.last_correct_seq_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use proptest::prelude::*;

    fn chunk(seq: i64, duration_us: i64) -> Chunk {
        Chunk::delta(seq * duration_us, duration_us, vec![seq as u8])
    }

    #[test]
    fn test_releases_once_target_reached() {
        let mut jitter = JitterBuffer::new(MediaType::Audio, 60.0, EventSink::disabled());
        assert!(jitter.add_item(chunk(0, 20_000), 0, ()).is_empty());
        assert!(jitter.add_item(chunk(1, 20_000), 1, ()).is_empty());

        let released = jitter.add_item(chunk(2, 20_000), 2, ());
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].seq_id, 0);
        assert!(!released[0].is_disco);
        assert_eq!(jitter.len(), 2);
    }

    #[test]
    fn test_reorders() {
        let mut jitter = JitterBuffer::new(MediaType::Video, 100.0, EventSink::disabled());
        let mut out = Vec::new();
        for seq in [0, 2, 1, 4, 3, 5, 6, 7] {
            out.extend(jitter.add_item(chunk(seq, 33_000), seq, ()).into_iter().map(|r| r.seq_id));
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_discontinuity_accounting() {
        // Zero buffering: every item is released on arrival
        let mut jitter = JitterBuffer::new(MediaType::Audio, 1.0, EventSink::disabled());
        let mut discos = Vec::new();
        for seq in [0, 1, 2, 5, 6] {
            for r in jitter.add_item(chunk(seq, 20_000), seq, ()) {
                discos.push(r.is_disco);
            }
        }
        assert_eq!(discos, vec![false, false, false, true, false]);

        let stats = jitter.stats();
        assert_eq!(stats.num_total_gaps, 1);
        assert_eq!(stats.num_total_lost_streams, 3);
    }

    #[test]
    fn test_repeated_does_not_advance() {
        let mut jitter = JitterBuffer::new(MediaType::Audio, 1.0, EventSink::disabled());
        jitter.add_item(chunk(0, 20_000), 0, ());
        jitter.add_item(chunk(1, 20_000), 1, ());

        let repeated = jitter.add_item(chunk(1, 20_000), 1, ());
        assert!(repeated[0].is_disco);
        assert!(repeated[0].repeated_or_backwards);

        let next = jitter.add_item(chunk(2, 20_000), 2, ());
        assert!(!next[0].is_disco);
        assert_eq!(jitter.stats().num_total_gaps, 0);
    }

    #[test]
    fn test_late_arrival_dropped_with_event() {
        let (events, rx) = EventSink::bounded(8);
        let mut jitter = JitterBuffer::new(MediaType::Video, 1_000.0, events);
        jitter.add_item(chunk(5, 33_000), 5, ());
        jitter.add_item(chunk(6, 33_000), 6, ());
        assert!(jitter.add_item(chunk(3, 33_000), 3, ()).is_empty());
        assert_eq!(jitter.len(), 2);

        match rx.try_recv().unwrap() {
            PipelineEvent::Dropped(event) => {
                assert_eq!(event.reason, DropReason::LateArrival);
                assert_eq!(event.seq_id, Some(3));
                assert_eq!(event.first_buffered_seq_id, Some(5));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_negative_seq_ids_not_classified() {
        let mut jitter = JitterBuffer::new(MediaType::Audio, 1.0, EventSink::disabled());
        let r = jitter.add_item(chunk(0, 20_000), -1, ());
        assert!(!r[0].is_disco);
        let r = jitter.add_item(chunk(0, 20_000), 7, ());
        assert!(!r[0].is_disco);
    }

    #[test]
    fn test_update_max_size_and_clear() {
        let mut jitter = JitterBuffer::new(MediaType::Audio, 0.0, EventSink::disabled());
        assert_eq!(jitter.stats().current_max_size_ms, DEFAULT_JITTER_BUFFER_MS as f64);

        jitter.update_max_size(-5.0);
        assert_eq!(jitter.stats().current_max_size_ms, DEFAULT_JITTER_BUFFER_MS as f64);
        jitter.update_max_size(40.0);

        jitter.add_item(chunk(0, 20_000), 0, ());
        let released = jitter.add_item(chunk(1, 20_000), 1, ());
        assert_eq!(released.len(), 1);

        jitter.clear();
        jitter.clear();
        assert!(jitter.is_empty());
        assert_eq!(jitter.stats().total_length_ms, 0.0);
    }

    proptest! {
        #[test]
        fn prop_in_order_releases_increase(
            seqs in proptest::collection::vec(0i64..200, 1..200),
            buffer_ms in 1.0f64..200.0,
        ) {
            let mut jitter = JitterBuffer::new(MediaType::Video, buffer_ms, EventSink::disabled());
            let mut last: Option<i64> = None;
            for seq in seqs {
                for r in jitter.add_item(chunk(seq, 10_000), seq, ()) {
                    if r.repeated_or_backwards {
                        prop_assert!(last.map_or(false, |l| r.seq_id <= l));
                    } else {
                        prop_assert!(last.map_or(true, |l| r.seq_id > l));
                        last = Some(r.seq_id);
                    }
                }
            }
        }

        #[test]
        fn prop_late_items_never_buffered(
            seqs in proptest::collection::vec(0i64..100, 1..100),
        ) {
            let mut jitter = JitterBuffer::new(MediaType::Audio, 10_000.0, EventSink::disabled());
            for seq in seqs {
                let before = jitter.len();
                let head = jitter.first_seq_id();
                jitter.add_item(chunk(seq, 10_000), seq, ());
                match head {
                    Some(head) if seq <= head => prop_assert_eq!(jitter.len(), before),
                    _ => prop_assert_eq!(jitter.len(), before + 1),
                }
            }
        }
    }
}
