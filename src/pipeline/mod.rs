//! Media pipelines around the codecs
//!
//! ```text
//! capture:  frame -> SyncOffsetCoordinator -> TimeCorrelationIndex -> encoder -> EncodedMessage
//! decode:   ReceivedObject -> JitterBuffer -> gates -> decoder -> DecodedOutput
//! render:   DecodedOutput -> VideoPacer (VideoRenderBuffer) -> renderer
//! ```

pub mod capture;
pub mod decode;
pub mod render;

pub use capture::{CapturePipeline, CaptureStats};
pub use decode::{DecodePipeline, DecodeStats, DecodedOutput};
pub use render::{PacerInput, PacerStats, PlaybackClock, RenderedFrame, VideoPacer};
