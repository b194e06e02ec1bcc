//! Track management module

pub mod manager;
pub mod track;

pub use manager::{SubscribeRejection, TrackEntry, TrackManager};
pub use track::{InFlightCounter, InFlightGuard, Subscriber, TrackDescriptor};
