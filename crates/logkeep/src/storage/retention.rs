// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic deletion of records older than the retention window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::StorageError;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(720 * 60 * 60);
pub const DEFAULT_CLEANUP_TICK: Duration = Duration::from_secs(3);
pub const DEFAULT_CLEANUP_PAGE: usize = 20;

/// A store whose expired records can be listed and deleted in pages.
#[async_trait]
pub trait RetentionTarget: Send + Sync {
    /// Identifiers of the oldest records with a timestamp before `cutoff`.
    async fn expired_page(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;

    async fn delete_batch(&self, ids: &[String]) -> Result<(), StorageError>;

    /// Called after a cycle that deleted at least one record.
    async fn compact(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionSettings {
    pub window: Duration,
    pub tick: Duration,
    pub page_size: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_RETENTION,
            tick: DEFAULT_CLEANUP_TICK,
            page_size: DEFAULT_CLEANUP_PAGE,
        }
    }
}

pub struct RetentionCleaner<T: ?Sized> {
    target: Arc<T>,
    settings: RetentionSettings,
}

impl<T: RetentionTarget + ?Sized> RetentionCleaner<T> {
    pub fn new(target: Arc<T>, settings: RetentionSettings) -> Self {
        RetentionCleaner { target, settings }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(Utc::now(), &cancel).await;
                }
                () = cancel.cancelled() => {
                    debug!("Retention cleaner shutting down");
                    break;
                }
            }
        }
    }

    /// Deletes every record older than `now - window`, one page at a time.
    /// Returns the number of deleted records.
    pub async fn run_cycle(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.settings.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return 0;
        };

        let mut deleted = 0;
        while !cancel.is_cancelled() {
            let ids = match self
                .target
                .expired_page(cutoff, self.settings.page_size)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "Unable to list expired messages");
                    break;
                }
            };
            if ids.is_empty() {
                break;
            }

            if let Err(e) = self.target.delete_batch(&ids).await {
                warn!(error = %e, nb_messages = ids.len(), "Unable to delete expired messages");
                break;
            }
            deleted += ids.len();
        }

        if deleted > 0 {
            info!(nb_messages = deleted, "Expired messages deleted");
            if let Err(e) = self.target.compact().await {
                warn!(error = %e, "Unable to compact storage after cleanup");
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct MemoryTarget {
        records: Mutex<Vec<(DateTime<Utc>, String)>>,
        fail_delete_after: Option<usize>,
        delete_calls: AtomicUsize,
        compacted: AtomicBool,
    }

    impl MemoryTarget {
        fn with_ages(ages_in_hours: &[i64], now: DateTime<Utc>) -> Self {
            let records = ages_in_hours
                .iter()
                .enumerate()
                .map(|(i, age)| (now - chrono::Duration::hours(*age), format!("id-{i}")))
                .collect();
            MemoryTarget {
                records: Mutex::new(records),
                ..Default::default()
            }
        }

        fn remaining(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RetentionTarget for MemoryTarget {
        async fn expired_page(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<String>, StorageError> {
            let mut expired: Vec<_> = self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|(ts, _)| *ts < cutoff)
                .cloned()
                .collect();
            expired.sort();
            Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
        }

        async fn delete_batch(&self, ids: &[String]) -> Result<(), StorageError> {
            let calls = self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete_after.is_some_and(|n| calls >= n) {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.records
                .lock()
                .unwrap()
                .retain(|(_, id)| !ids.contains(id));
            Ok(())
        }

        async fn compact(&self) -> Result<(), StorageError> {
            self.compacted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(page_size: usize) -> RetentionSettings {
        RetentionSettings {
            window: Duration::from_secs(24 * 60 * 60),
            page_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cycle_deletes_all_expired_pages() {
        let now = Utc::now();
        let mut ages = vec![1; 5];
        ages.extend(vec![48; 45]);
        let target = Arc::new(MemoryTarget::with_ages(&ages, now));
        let cleaner = RetentionCleaner::new(Arc::clone(&target), settings(20));

        let deleted = cleaner.run_cycle(now, &CancellationToken::new()).await;

        assert_eq!(deleted, 45);
        assert_eq!(target.remaining(), 5);
        assert_eq!(target.delete_calls.load(Ordering::SeqCst), 3);
        assert!(target.compacted.load(Ordering::SeqCst));
        assert!(logs_contain("Expired messages deleted"));
    }

    #[tokio::test]
    async fn test_cycle_without_expired_records_does_nothing() {
        let now = Utc::now();
        let target = Arc::new(MemoryTarget::with_ages(&[1, 2, 3], now));
        let cleaner = RetentionCleaner::new(Arc::clone(&target), settings(20));

        assert_eq!(cleaner.run_cycle(now, &CancellationToken::new()).await, 0);
        assert_eq!(target.delete_calls.load(Ordering::SeqCst), 0);
        assert!(!target.compacted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_page_failure_stops_cycle_early() {
        let now = Utc::now();
        let mut target = MemoryTarget::with_ages(&[48; 30], now);
        target.fail_delete_after = Some(1);
        let target = Arc::new(target);
        let cleaner = RetentionCleaner::new(Arc::clone(&target), settings(10));

        let deleted = cleaner.run_cycle(now, &CancellationToken::new()).await;

        assert_eq!(deleted, 10);
        assert_eq!(target.remaining(), 20);
        assert_eq!(target.delete_calls.load(Ordering::SeqCst), 2);
        assert!(logs_contain("Unable to delete expired messages"));
    }

    #[tokio::test]
    async fn test_run_returns_on_cancel() {
        let target = Arc::new(MemoryTarget::default());
        let cleaner = RetentionCleaner::new(target, RetentionSettings::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(cleaner.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleaner did not stop")
            .unwrap();
    }
}
