//! Bounded FIFO of decoded frames waiting to be rendered

use std::collections::VecDeque;

use super::RenderFrame;
use crate::constants::DEFAULT_RENDER_BUFFER_CAPACITY;

struct Held<F> {
    frame: F,
    capture_clock_ms: i64,
}

/// Result of a render buffer query
#[derive(Debug)]
pub struct RenderSelection<F> {
    /// Frame to render, if any
    pub frame: Option<F>,
    pub capture_clock_ms: Option<i64>,
    /// Frames released by this call
    pub discarded: usize,
    pub total_discarded: u64,
    pub queue_size: usize,
    pub queue_length_ms: f64,
}

/// Video render buffer
///
/// Frames are appended in decode order, which is presentation order for the
/// codecs in use. Every frame that leaves the buffer without being returned
/// is released explicitly.
pub struct VideoRenderBuffer<F: RenderFrame> {
    items: VecDeque<Held<F>>,
    capacity: usize,
    total_discarded: u64,
    total_length_ms: f64,
}

impl<F: RenderFrame> VideoRenderBuffer<F> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RENDER_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total_discarded: 0,
            total_length_ms: 0.0,
        }
    }

    /// Append a frame; a full buffer hands the frame back for the caller to release
    pub fn add_item(&mut self, frame: F, capture_clock_ms: i64) -> Result<(), F> {
        if self.items.len() >= self.capacity {
            return Err(frame);
        }
        self.total_length_ms += frame.duration() as f64 / 1000.0;
        self.items.push_back(Held {
            frame,
            capture_clock_ms,
        });
        Ok(())
    }

    fn take_head(&mut self) -> Option<Held<F>> {
        let held = self.items.pop_front()?;
        self.total_length_ms -= held.frame.duration() as f64 / 1000.0;
        if self.items.is_empty() {
            self.total_length_ms = 0.0;
        }
        Some(held)
    }

    fn selection(&self, held: Option<Held<F>>, discarded: usize) -> RenderSelection<F> {
        let (frame, capture_clock_ms) = match held {
            Some(h) => (Some(h.frame), Some(h.capture_clock_ms)),
            None => (None, None),
        };
        RenderSelection {
            frame,
            capture_clock_ms,
            discarded,
            total_discarded: self.total_discarded,
            queue_size: self.items.len(),
            queue_length_ms: self.total_length_ms,
        }
    }

    /// Select the newest frame not after `ts`, releasing the older ones
    pub fn get_item_by_ts(&mut self, ts: i64) -> RenderSelection<F> {
        let due = self
            .items
            .iter()
            .take_while(|h| h.frame.timestamp() <= ts)
            .count();
        if due == 0 {
            return self.selection(None, 0);
        }

        let discarded = due - 1;
        for _ in 0..discarded {
            if let Some(held) = self.take_head() {
                held.frame.release();
            }
        }
        self.total_discarded += discarded as u64;

        let held = self.take_head();
        self.selection(held, discarded)
    }

    /// Pop the head regardless of its timestamp
    pub fn get_first_element(&mut self) -> RenderSelection<F> {
        let held = self.take_head();
        self.selection(held, 0)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Release every held frame
    pub fn clear(&mut self) {
        while let Some(held) = self.items.pop_front() {
            held.frame.release();
        }
        self.total_length_ms = 0.0;
        self.total_discarded = 0;
    }
}

impl<F: RenderFrame> Default for VideoRenderBuffer<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: RenderFrame> Drop for VideoRenderBuffer<F> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TestFrame {
        ts: i64,
        released: Arc<AtomicUsize>,
    }

    impl RenderFrame for TestFrame {
        fn timestamp(&self) -> i64 {
            self.ts
        }

        fn duration(&self) -> i64 {
            33_000
        }

        fn release(self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn filled(timestamps: &[i64]) -> (VideoRenderBuffer<TestFrame>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let mut buffer = VideoRenderBuffer::new();
        for &ts in timestamps {
            let frame = TestFrame {
                ts,
                released: released.clone(),
            };
            assert!(buffer.add_item(frame, ts / 1000).is_ok());
        }
        (buffer, released)
    }

    #[test]
    fn test_select_by_ts() {
        let (mut buffer, released) = filled(&[0, 33_000, 66_000, 99_000]);

        let sel = buffer.get_item_by_ts(70_000);
        assert_eq!(sel.frame.as_ref().map(|f| f.ts), Some(66_000));
        assert_eq!(sel.capture_clock_ms, Some(66));
        assert_eq!(sel.discarded, 2);
        assert_eq!(sel.total_discarded, 2);
        assert_eq!(sel.queue_size, 1);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nothing_due_yet() {
        let (mut buffer, _) = filled(&[100_000]);
        let sel = buffer.get_item_by_ts(50_000);
        assert!(sel.frame.is_none());
        assert_eq!(sel.queue_size, 1);
    }

    #[test]
    fn test_full_returns_frame() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut buffer = VideoRenderBuffer::with_capacity(1);
        let f = |ts| TestFrame {
            ts,
            released: released.clone(),
        };
        assert!(buffer.add_item(f(0), 0).is_ok());
        let rejected = buffer.add_item(f(1), 0).unwrap_err();
        assert_eq!(rejected.ts, 1);
    }

    #[test]
    fn test_first_element_and_clear() {
        let (mut buffer, released) = filled(&[10, 20, 30]);
        let sel = buffer.get_first_element();
        assert_eq!(sel.frame.map(|f| f.ts), Some(10));
        assert_eq!(sel.queue_size, 2);

        buffer.clear();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_selection_monotonic() {
        let timestamps: Vec<i64> = (0..60).map(|i| i * 33_000).collect();
        let (mut buffer, _) = filled(&timestamps);

        let mut last = i64::MIN;
        for query in (0..100).map(|i| i * 21_000) {
            if let Some(frame) = buffer.get_item_by_ts(query).frame {
                assert!(frame.ts <= query);
                assert!(frame.ts > last);
                last = frame.ts;
            }
        }
    }
}
