//! Timing: capture time correlation, A/V offset and decoder queue tracking

pub mod pts_queue;
pub mod sync;
pub mod time_index;

pub use pts_queue::{PtsQueue, QueueLengthInfo};
pub use sync::{SharedSyncRegion, SyncMode, SyncOffsetCoordinator, SyncStream, SyncedTimestamp};
pub use time_index::{TimeCorrelationIndex, TimingRecord};
