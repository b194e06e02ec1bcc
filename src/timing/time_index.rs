//! Media timestamp to capture wall clock correlation

use std::collections::VecDeque;

use crate::constants::TIME_INDEX_MAX_RECORDS;

/// Timing captured for one raw frame before it entered the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingRecord {
    /// Raw media timestamp in microseconds
    pub ts: i64,
    /// Timestamp on the shared A/V timeline
    pub compensated_ts: i64,
    /// Estimated duration in microseconds, -1 when unknown
    pub estimated_duration: i64,
    /// Wall clock at capture
    pub capture_clock_ms: i64,
}

/// Append-only list of timing records, consumed in nearest-past order
///
/// The encoder may merge, drop or delay frames, so the record for an encoded
/// chunk is the newest one not after the chunk's timestamp.
///
/// Records are appended unconditionally up to a cap (300 by default). When the
/// index is full, appending evicts the oldest record.
#[derive(Debug)]
pub struct TimeCorrelationIndex {
    records: VecDeque<TimingRecord>,
    max_records: usize,
}

impl TimeCorrelationIndex {
    pub fn new() -> Self {
        Self::with_max_records(TIME_INDEX_MAX_RECORDS)
    }

    /// Index that keeps at most `max_records`, evicting the oldest
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: VecDeque::new(),
            max_records: max_records.max(1),
        }
    }

    /// Append a record, evicting the oldest one when the cap is reached
    pub fn add_item(&mut self, record: TimingRecord) {
        if self.records.len() >= self.max_records {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Find the record for `ts` and discard it together with everything older
    ///
    /// In nearest-past mode the newest record with `record.ts <= ts` wins. In
    /// exact mode only `record.ts == ts` qualifies. `None` is a normal outcome
    /// when the capture side has not produced a matching record.
    pub fn get_item_by_ts(&mut self, ts: i64, exact: bool) -> Option<TimingRecord> {
        let mut found = None;
        for (i, record) in self.records.iter().enumerate() {
            if exact {
                if record.ts == ts {
                    found = Some(i);
                }
            } else if record.ts <= ts {
                found = Some(i);
            } else {
                break;
            }
        }

        let index = found?;
        let record = self.records[index];
        self.records.drain(..=index);
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl Default for TimeCorrelationIndex {
    fn default() -> Self {
        Self::new()
    }
}
