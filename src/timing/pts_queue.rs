//! Tracks what is sitting in a decoder queue

use std::collections::VecDeque;

/// Size and duration of the queued chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct QueueLengthInfo {
    pub size: usize,
    pub length_ms: i64,
}

/// FIFO of `(timestamp, duration)` mirroring a decoder's input queue
#[derive(Debug, Default)]
pub struct PtsQueue {
    entries: VecDeque<(i64, i64)>,
}

impl PtsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ts: i64, duration: i64) {
        self.entries.push_back((ts, duration));
    }

    /// Drop the oldest entries until at most `decode_queue_size` remain
    pub fn remove_until(&mut self, decode_queue_size: usize) {
        while self.entries.len() > decode_queue_size {
            self.entries.pop_front();
        }
    }

    pub fn length_info(&self) -> QueueLengthInfo {
        let total_us: i64 = self.entries.iter().map(|(_, d)| (*d).max(0)).sum();
        QueueLengthInfo {
            size: self.entries.len(),
            length_ms: total_us / 1000,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
