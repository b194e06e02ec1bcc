//! Codec collaborators
//!
//! The pipelines drive encoders and decoders through the [`MediaEncoder`]
//! and [`MediaDecoder`] traits. Both are submit/poll: a submitted frame or
//! chunk may come out later, and `queue_size` reports how many are still
//! inside the codec. The raw implementations here carry PCM samples and
//! uncompressed pictures and are used by the loopback binary and tests.

pub mod decoder;
pub mod encoder;

pub use decoder::{MediaDecoder, PcmDecoder, RawVideoDecoder};
pub use encoder::{EncodedOutput, EncoderConfig, MediaEncoder, PcmEncoder, RawVideoEncoder};

use crate::audio::AudioFrame;
use crate::media::MediaType;
use crate::video::VideoFrame;

/// An unencoded media frame, as captured or as decoded
pub trait CaptureFrame: Send {
    /// Media timestamp in microseconds
    fn timestamp(&self) -> i64;

    fn media_type(&self) -> MediaType;

    /// Give the underlying resource back when the frame is dropped unencoded
    fn release(self)
    where
        Self: Sized,
    {
    }
}

impl CaptureFrame for AudioFrame {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn media_type(&self) -> MediaType {
        MediaType::Audio
    }
}

impl CaptureFrame for VideoFrame {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn media_type(&self) -> MediaType {
        MediaType::Video
    }
}
