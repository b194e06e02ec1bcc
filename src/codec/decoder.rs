//! Decoder interface and raw decoders

use bytes::Buf;
use std::collections::VecDeque;

use super::encoder::{parse_audio_metadata, parse_video_metadata};
use crate::audio::AudioFrame;
use crate::error::CodecError;
use crate::media::Chunk;
use crate::video::VideoFrame;

/// Chunk decoder driven by a decode pipeline
pub trait MediaDecoder: Send {
    type Output: Send;

    /// Configure from the metadata carried by a chunk
    fn configure(&mut self, metadata: &[u8]) -> Result<(), CodecError>;

    fn is_configured(&self) -> bool;

    fn decode(&mut self, chunk: Chunk) -> Result<(), CodecError>;

    /// Chunks submitted but not yet output
    fn queue_size(&self) -> usize;

    /// Next decoded frame, if any
    fn poll_output(&mut self) -> Option<Self::Output>;

    /// Finish every pending chunk
    fn flush(&mut self) -> Result<(), CodecError>;

    fn close(&mut self);
}

/// Decoder for [`super::PcmEncoder`] output
pub struct PcmDecoder {
    config: Option<(u32, u16)>,
    output: VecDeque<AudioFrame>,
    frames_decoded: u64,
    closed: bool,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self {
            config: None,
            output: VecDeque::new(),
            frames_decoded: 0,
            closed: false,
        }
    }

    /// Get number of decoded frames
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDecoder for PcmDecoder {
    type Output = AudioFrame;

    fn configure(&mut self, metadata: &[u8]) -> Result<(), CodecError> {
        let (sample_rate, channels) = parse_audio_metadata(metadata)?;
        if sample_rate == 0 || channels == 0 {
            return Err(CodecError::DecoderConfig(format!(
                "invalid PCM config {}Hz/{}ch",
                sample_rate, channels
            )));
        }
        tracing::debug!("PCM decoder configured: {}Hz, {} channels", sample_rate, channels);
        self.config = Some((sample_rate, channels));
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn decode(&mut self, chunk: Chunk) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        let (sample_rate, channels) = self
            .config
            .ok_or_else(|| CodecError::DecodingFailed("decoder not configured".into()))?;
        let mut payload = chunk.payload;
        if payload.len() % (4 * channels as usize) != 0 {
            return Err(CodecError::DecodingFailed(format!(
                "PCM payload of {} bytes is not whole {} channel frames",
                payload.len(),
                channels
            )));
        }

        let mut samples = Vec::with_capacity(payload.len() / 4);
        while payload.has_remaining() {
            samples.push(payload.get_f32_le());
        }
        self.frames_decoded += 1;
        self.output
            .push_back(AudioFrame::new(samples, channels, sample_rate, chunk.timestamp));
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.output.len()
    }

    fn poll_output(&mut self) -> Option<AudioFrame> {
        self.output.pop_front()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.output.clear();
    }
}

/// Decoder for [`super::RawVideoEncoder`] output
pub struct RawVideoDecoder {
    config: Option<(u32, u32)>,
    output: VecDeque<VideoFrame>,
    closed: bool,
}

impl RawVideoDecoder {
    pub fn new() -> Self {
        Self {
            config: None,
            output: VecDeque::new(),
            closed: false,
        }
    }
}

impl Default for RawVideoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaDecoder for RawVideoDecoder {
    type Output = VideoFrame;

    fn configure(&mut self, metadata: &[u8]) -> Result<(), CodecError> {
        let (width, height) = parse_video_metadata(metadata)?;
        tracing::debug!("Video decoder configured: {}x{}", width, height);
        self.config = Some((width, height));
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn decode(&mut self, chunk: Chunk) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        let (width, height) = self
            .config
            .ok_or_else(|| CodecError::DecodingFailed("decoder not configured".into()))?;
        self.output.push_back(VideoFrame {
            timestamp: chunk.timestamp,
            duration: chunk.duration,
            width,
            height,
            data: chunk.payload,
        });
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.output.len()
    }

    fn poll_output(&mut self) -> Option<VideoFrame> {
        self.output.pop_front()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.output.clear();
    }
}
