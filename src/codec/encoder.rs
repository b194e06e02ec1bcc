//! Encoder interface and raw encoders

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

use super::CaptureFrame;
use crate::audio::AudioFrame;
use crate::error::CodecError;
use crate::media::Chunk;
use crate::video::VideoFrame;

/// Encoder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderConfig {
    Audio { sample_rate: u32, channels: u16 },
    Video { width: u32, height: u32 },
}

/// One chunk produced by an encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedOutput {
    pub chunk: Chunk,
    /// Decoder configuration, present when the encoder (re)describes the stream
    pub metadata: Option<Bytes>,
}

/// Frame encoder driven by a capture pipeline
pub trait MediaEncoder: Send {
    type Frame: CaptureFrame;

    fn configure(&mut self, config: &EncoderConfig) -> Result<(), CodecError>;

    /// Submit a frame; `key_frame` forces an independently decodable chunk
    fn encode(&mut self, frame: Self::Frame, key_frame: bool) -> Result<(), CodecError>;

    /// Frames submitted but not yet output
    fn queue_size(&self) -> usize;

    /// Next encoded chunk, if any
    fn poll_output(&mut self) -> Option<EncodedOutput>;

    /// Finish every pending frame
    fn flush(&mut self) -> Result<(), CodecError>;

    fn close(&mut self);
}

/// Audio stream description: sample rate then channel count
pub(crate) fn audio_metadata(sample_rate: u32, channels: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u32(sample_rate);
    buf.put_u16(channels);
    buf.freeze()
}

pub(crate) fn parse_audio_metadata(mut metadata: &[u8]) -> Result<(u32, u16), CodecError> {
    if metadata.remaining() < 6 {
        return Err(CodecError::DecoderConfig("audio metadata too short".into()));
    }
    Ok((metadata.get_u32(), metadata.get_u16()))
}

/// Video stream description: width then height
pub(crate) fn video_metadata(width: u32, height: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(width);
    buf.put_u32(height);
    buf.freeze()
}

pub(crate) fn parse_video_metadata(mut metadata: &[u8]) -> Result<(u32, u32), CodecError> {
    if metadata.remaining() < 8 {
        return Err(CodecError::DecoderConfig("video metadata too short".into()));
    }
    Ok((metadata.get_u32(), metadata.get_u32()))
}

/// Little-endian f32 PCM "encoder"
///
/// Every chunk is a key chunk. Metadata is attached to the first chunk only.
pub struct PcmEncoder {
    config: Option<(u32, u16)>,
    output: VecDeque<EncodedOutput>,
    metadata_sent: bool,
    closed: bool,
}

impl PcmEncoder {
    pub fn new() -> Self {
        Self {
            config: None,
            output: VecDeque::new(),
            metadata_sent: false,
            closed: false,
        }
    }
}

impl Default for PcmEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEncoder for PcmEncoder {
    type Frame = AudioFrame;

    fn configure(&mut self, config: &EncoderConfig) -> Result<(), CodecError> {
        match *config {
            EncoderConfig::Audio { sample_rate, channels } if sample_rate > 0 && channels > 0 => {
                self.config = Some((sample_rate, channels));
                self.metadata_sent = false;
                Ok(())
            }
            other => Err(CodecError::EncoderConfig(format!("unsupported PCM config {:?}", other))),
        }
    }

    fn encode(&mut self, frame: AudioFrame, _key_frame: bool) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        let (sample_rate, channels) = self
            .config
            .ok_or_else(|| CodecError::EncodingFailed("encoder not configured".into()))?;
        if frame.sample_rate != sample_rate || frame.channels != channels {
            return Err(CodecError::EncodingFailed(format!(
                "frame is {}Hz/{}ch, encoder expects {}Hz/{}ch",
                frame.sample_rate, frame.channels, sample_rate, channels
            )));
        }

        let mut payload = BytesMut::with_capacity(frame.samples.len() * 4);
        for sample in &frame.samples {
            payload.put_f32_le(*sample);
        }
        let metadata = (!self.metadata_sent).then(|| audio_metadata(sample_rate, channels));
        self.metadata_sent = true;

        self.output.push_back(EncodedOutput {
            chunk: Chunk::key(frame.timestamp, frame.duration_us(), payload.freeze()),
            metadata,
        });
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.output.len()
    }

    fn poll_output(&mut self) -> Option<EncodedOutput> {
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

/// Uncompressed video "encoder"
///
/// Key chunks carry the picture size as metadata.
pub struct RawVideoEncoder {
    config: Option<(u32, u32)>,
    output: VecDeque<EncodedOutput>,
    started: bool,
    closed: bool,
}

impl RawVideoEncoder {
    pub fn new() -> Self {
        Self {
            config: None,
            output: VecDeque::new(),
            started: false,
            closed: false,
        }
    }
}

impl Default for RawVideoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEncoder for RawVideoEncoder {
    type Frame = VideoFrame;

    fn configure(&mut self, config: &EncoderConfig) -> Result<(), CodecError> {
        match *config {
            EncoderConfig::Video { width, height } if width > 0 && height > 0 => {
                self.config = Some((width, height));
                self.started = false;
                Ok(())
            }
            other => Err(CodecError::EncoderConfig(format!("unsupported video config {:?}", other))),
        }
    }

    fn encode(&mut self, frame: VideoFrame, key_frame: bool) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::Closed);
        }
        let (width, height) = self
            .config
            .ok_or_else(|| CodecError::EncodingFailed("encoder not configured".into()))?;

        // The first chunk after configure is always a key chunk
        let key = key_frame || !self.started;
        self.started = true;
        let (chunk, metadata) = if key {
            (
                Chunk::key(frame.timestamp, frame.duration, frame.data),
                Some(video_metadata(width, height)),
            )
        } else {
            (Chunk::delta(frame.timestamp, frame.duration, frame.data), None)
        };
        self.output.push_back(EncodedOutput { chunk, metadata });
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.output.len()
    }

    fn poll_output(&mut self) -> Option<EncodedOutput> {
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
