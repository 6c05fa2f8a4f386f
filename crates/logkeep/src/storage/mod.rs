// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage abstraction shared by the ingestion and query workers.
//!
//! A backend buffers enqueued records in a [`buffer::PendingBuffer`] and
//! persists them in batches from its flush loop. Backends are selected once
//! at startup through [`StorageConfig`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::StorageError;
use crate::record::{LogRecord, SearchQuery, SearchResult};

pub mod buffer;
pub mod elastic;
pub mod embedded;
pub mod flusher;
pub mod retention;

pub use buffer::BufferStats;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the stored document for `id` as the backend holds it.
    async fn lookup_by_id(&self, id: &str) -> Result<Map<String, Value>, StorageError>;

    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError>;

    /// Adds a record to the pending buffer. Never blocks on the backend.
    fn enqueue(&self, record: LogRecord);

    /// Runs until `cancel` fires, then performs a final flush and returns.
    async fn run_flush_loop(&self, cancel: CancellationToken);

    /// Checks `query` against the backend's query language.
    ///
    /// Callers skip this for an empty query, which always means match-all.
    async fn validate_query_syntax(&self, query: &str) -> Result<(), StorageError>;

    fn stats(&self) -> BufferStats;
}

/// Backend selection, resolved from configuration at startup.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Elastic(elastic::ElasticConfig),
    Embedded(embedded::EmbeddedConfig),
}

pub async fn build(config: StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config {
        StorageConfig::Elastic(config) => {
            let storage = elastic::ElasticStorage::new(config)?;
            Ok(Arc::new(storage))
        }
        StorageConfig::Embedded(config) => {
            let storage = embedded::EmbeddedStorage::open(config).await?;
            Ok(Arc::new(storage))
        }
    }
}
