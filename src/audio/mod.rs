//! Audio subsystem module

pub mod buffer;

pub use buffer::{AudioConsumer, AudioFrame, CircularAudioBuffer, RingStats};
