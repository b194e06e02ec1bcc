//! A/V timeline origin shared by the capture pipelines
//!
//! Audio and video capture run in separate contexts with their own clocks.
//! The first stream to produce a frame claims the origin: its first frame
//! lands at compensated time 0. The other stream aligns its first frame to
//! the claimer's latest compensated time.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

const NO_LEADER: u8 = 0;

/// Bound on the wait for the leader to publish its offset
const PUBLISH_SPIN_LIMIT: u32 = 100_000;

/// Which slot of the shared region a pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStream {
    Audio,
    Video,
}

impl SyncStream {
    fn index(self) -> usize {
        match self {
            SyncStream::Audio => 0,
            SyncStream::Video => 1,
        }
    }

    fn leader_tag(self) -> u8 {
        self.index() as u8 + 1
    }

    fn other(self) -> SyncStream {
        match self {
            SyncStream::Audio => SyncStream::Video,
            SyncStream::Video => SyncStream::Audio,
        }
    }
}

#[derive(Debug, Default)]
struct StreamSlot {
    raw_ts: AtomicI64,
    offset: AtomicI64,
    published: AtomicBool,
}

/// Atomic region shared between the audio and video capture pipelines
#[derive(Debug, Default)]
pub struct SharedSyncRegion {
    leader: AtomicU8,
    slots: [CachePadded<StreamSlot>; 2],
}

impl SharedSyncRegion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latest raw timestamp and offset of a stream, once it has published
    pub fn published(&self, stream: SyncStream) -> Option<(i64, i64)> {
        let slot = &self.slots[stream.index()];
        if !slot.published.load(Ordering::Acquire) {
            return None;
        }
        Some((
            slot.raw_ts.load(Ordering::Acquire),
            slot.offset.load(Ordering::Acquire),
        ))
    }

    pub fn leader(&self) -> Option<SyncStream> {
        match self.leader.load(Ordering::Acquire) {
            1 => Some(SyncStream::Audio),
            2 => Some(SyncStream::Video),
            _ => None,
        }
    }
}

/// How a pipeline derives its offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Share the origin with the other stream
    #[default]
    Shared,
    /// Use the stream's own first frame as origin (video only calls)
    Independent,
}

/// Compensated timing for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncedTimestamp {
    pub compensated_ts: i64,
    /// `ts - previous ts`, -1 on the first frame
    pub estimated_duration: i64,
}

/// Per-pipeline side of the offset computation
#[derive(Debug)]
pub struct SyncOffsetCoordinator {
    region: Arc<SharedSyncRegion>,
    stream: SyncStream,
    mode: SyncMode,
    offset: Option<i64>,
    previous_ts: Option<i64>,
}

impl SyncOffsetCoordinator {
    pub fn new(region: Arc<SharedSyncRegion>, stream: SyncStream, mode: SyncMode) -> Self {
        Self {
            region,
            stream,
            mode,
            offset: None,
            previous_ts: None,
        }
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Process the raw timestamp of the next captured frame
    pub fn process(&mut self, ts: i64) -> SyncedTimestamp {
        let slot = &self.region.slots[self.stream.index()];
        slot.raw_ts.store(ts, Ordering::Release);

        let offset = match self.offset {
            Some(offset) => offset,
            None => {
                let offset = self.first_offset(ts);
                self.offset = Some(offset);
                offset
            }
        };

        let estimated_duration = match self.previous_ts {
            Some(previous) => ts - previous,
            None => -1,
        };
        self.previous_ts = Some(ts);

        SyncedTimestamp {
            compensated_ts: ts + offset,
            estimated_duration,
        }
    }

    fn first_offset(&self, ts: i64) -> i64 {
        if self.mode == SyncMode::Independent {
            tracing::debug!(stream = ?self.stream, ts, "Using independent timeline origin");
            return -ts;
        }

        let slot = &self.region.slots[self.stream.index()];
        let claimed = self
            .region
            .leader
            .compare_exchange(
                NO_LEADER,
                self.stream.leader_tag(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        let offset = if claimed {
            -ts
        } else {
            match self.wait_for_leader() {
                Some((other_raw_ts, other_offset)) => -ts + other_raw_ts + other_offset,
                None => {
                    tracing::warn!(stream = ?self.stream, "Leader never published an offset, using own origin");
                    -ts
                }
            }
        };

        slot.offset.store(offset, Ordering::Release);
        slot.published.store(true, Ordering::Release);
        tracing::info!(stream = ?self.stream, offset, leader = claimed, "Timeline offset set");
        offset
    }

    fn wait_for_leader(&self) -> Option<(i64, i64)> {
        let other = self.stream.other();
        for i in 0..PUBLISH_SPIN_LIMIT {
            if let Some(published) = self.region.published(other) {
                return Some(published);
            }
            if i % 64 == 63 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        None
    }
}
