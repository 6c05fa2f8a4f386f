// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::StorageError;
use crate::record::LogRecord;
use crate::storage::buffer::{PendingBuffer, DEFAULT_MAX_PENDING};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Backend side of a flush: persists one batch in a single round trip.
#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Every record in `batch` already carries its identifier.
    async fn write_batch(&self, batch: &[LogRecord]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub poll_interval: Duration,
    pub max_pending: usize,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

#[must_use]
pub fn should_flush(
    pending: usize,
    batch_size: usize,
    elapsed: Duration,
    flush_interval: Duration,
) -> bool {
    pending > 0 && (pending >= batch_size || elapsed > flush_interval)
}

/// Gives every record without an identifier a fresh one.
///
/// Records restored after a failed write keep theirs, so a retried batch
/// overwrites instead of duplicating.
pub fn assign_ids(batch: &mut [LogRecord]) {
    for record in batch.iter_mut().filter(|r| !r.is_persisted()) {
        record.id = uuid::Uuid::new_v4().to_string();
    }
}

pub struct Flusher<W: ?Sized> {
    buffer: Arc<PendingBuffer>,
    writer: Arc<W>,
    settings: FlushSettings,
    last_flush: Instant,
}

impl<W: BatchWriter + ?Sized> Flusher<W> {
    pub fn new(buffer: Arc<PendingBuffer>, writer: Arc<W>, settings: FlushSettings) -> Self {
        Flusher {
            buffer,
            writer,
            settings,
            last_flush: Instant::now(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.flush_if_due_at(Instant::now()).await;
                }
                () = cancel.cancelled() => {
                    debug!("Flush loop shutting down, performing final flush");
                    let _ = self.flush_at(Instant::now()).await;
                    break;
                }
            }
        }
    }

    /// Flushes when the trigger rule holds at `now`. Returns the number of
    /// records written.
    pub async fn flush_if_due_at(&mut self, now: Instant) -> Result<usize, StorageError> {
        let pending = self.buffer.len();
        let elapsed = now.saturating_duration_since(self.last_flush);
        if !should_flush(
            pending,
            self.settings.batch_size,
            elapsed,
            self.settings.flush_interval,
        ) {
            return Ok(0);
        }
        self.flush_at(now).await
    }

    /// Unconditionally writes whatever is pending.
    pub async fn flush_at(&mut self, now: Instant) -> Result<usize, StorageError> {
        let mut batch = self.buffer.take();
        if batch.is_empty() {
            return Ok(0);
        }
        assign_ids(&mut batch);

        let nb_messages = batch.len();
        match self.writer.write_batch(&batch).await {
            Ok(()) => {
                self.last_flush = now;
                self.buffer.set_last_flush_failed(false);
                info!(nb_messages, "Messages flushed");
                Ok(nb_messages)
            }
            Err(e) => {
                warn!(
                    nb_messages,
                    error = %e,
                    "Unable to flush messages, keeping them for the next attempt"
                );
                self.buffer.set_last_flush_failed(true);
                self.buffer.restore(batch);
                Err(e)
            }
        }
    }
}
