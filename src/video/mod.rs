//! Decoded video frames and render-side buffering

pub mod render_buffer;

pub use render_buffer::{RenderSelection, VideoRenderBuffer};

use bytes::Bytes;

/// A decoded frame that may hold a scarce resource (GPU surface, pool slot)
///
/// Frames are consumed by `release` when they are dropped from a buffer
/// without being rendered.
pub trait RenderFrame: Send {
    /// Presentation timestamp in microseconds
    fn timestamp(&self) -> i64;

    /// Duration in microseconds
    fn duration(&self) -> i64;

    /// Give the underlying resource back
    fn release(self)
    where
        Self: Sized,
    {
    }
}

/// CPU-side decoded picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub timestamp: i64,
    pub duration: i64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl RenderFrame for VideoFrame {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn duration(&self) -> i64 {
        self.duration
    }
}
