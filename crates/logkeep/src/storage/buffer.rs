// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::record::LogRecord;

pub const DEFAULT_MAX_PENDING: usize = 100_000;

/// Snapshot of the pending buffer, served by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub pending: usize,
    pub dropped: u64,
    pub last_flush_failed: bool,
}

/// Records waiting for the next flush.
///
/// Append and swap share one lock. Past `max_pending` the oldest record is
/// dropped so that a backend outage cannot grow memory without bound.
pub struct PendingBuffer {
    records: Mutex<VecDeque<LogRecord>>,
    max_pending: usize,
    dropped: AtomicU64,
    last_flush_failed: AtomicBool,
}

impl PendingBuffer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_pending: max_pending.max(1),
            dropped: AtomicU64::new(0),
            last_flush_failed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let evicted = {
            #[allow(clippy::expect_used)]
            let mut records = self.records.lock().expect("lock poisoned");
            let evicted = if records.len() >= self.max_pending {
                records.pop_front().map_or(0, |_| 1)
            } else {
                0
            };
            records.push_back(record);
            evicted
        };

        if evicted > 0 {
            self.record_drops(evicted);
        }
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let records = self.records.lock().expect("lock poisoned");
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps the pending records out, leaving an empty buffer behind.
    pub fn take(&self) -> Vec<LogRecord> {
        #[allow(clippy::expect_used)]
        let mut records = self.records.lock().expect("lock poisoned");
        Vec::from(std::mem::take(&mut *records))
    }

    /// Puts a batch that failed to flush back in front of the records that
    /// arrived in the meantime, dropping the oldest past the cap.
    pub fn restore(&self, batch: Vec<LogRecord>) {
        let evicted = {
            #[allow(clippy::expect_used)]
            let mut records = self.records.lock().expect("lock poisoned");
            let newer = std::mem::take(&mut *records);
            records.extend(batch);
            records.extend(newer);

            let excess = records.len().saturating_sub(self.max_pending);
            records.drain(..excess);
            excess as u64
        };

        if evicted > 0 {
            self.record_drops(evicted);
        }
    }

    pub fn set_last_flush_failed(&self, failed: bool) {
        self.last_flush_failed.store(failed, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_flush_failed: self.last_flush_failed.load(Ordering::Relaxed),
        }
    }

    fn record_drops(&self, count: u64) {
        let total = self.dropped.fetch_add(count, Ordering::Relaxed) + count;
        warn!(
            nb_messages = count,
            total_dropped = total,
            max_pending = self.max_pending,
            "Pending buffer full, dropping oldest messages"
        );
    }
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
