// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Embedded full-text backend.
//!
//! The index lives in memory and is persisted under the data directory as an
//! append-only log of JSON lines, one `index` or `delete` operation per line.
//! The log is replayed on open and rewritten once stale entries outnumber the
//! live records.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::StorageError;
use crate::record::{LogRecord, SearchQuery, SearchResult};
use crate::storage::buffer::{BufferStats, PendingBuffer};
use crate::storage::flusher::{BatchWriter, FlushSettings, Flusher};
use crate::storage::retention::{RetentionCleaner, RetentionSettings, RetentionTarget};
use crate::storage::Storage;

pub mod index;
pub mod query;

use index::MemoryIndex;

const LOG_FILE: &str = "messages.jsonl";

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedConfig {
    pub datapath: PathBuf,
    pub flush: FlushSettings,
    pub retention: RetentionSettings,
}

impl EmbeddedConfig {
    pub fn new(datapath: PathBuf) -> Self {
        EmbeddedConfig {
            datapath,
            flush: FlushSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Op {
    Index { record: LogRecord },
    Delete { id: String },
}

struct OpLog {
    path: PathBuf,
    file: File,
    entries: usize,
    /// Length of the log up to the last fully written entry.
    committed: u64,
}

impl OpLog {
    /// Opens the log under `dir`, replaying it into `index`.
    fn open(dir: &Path, index: &mut MemoryIndex) -> Result<Self, StorageError> {
        let path = dir.join(LOG_FILE);
        let mut entries = 0;
        let mut corrupt = 0;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                entries += 1;
                match serde_json::from_str::<Op>(&line) {
                    Ok(Op::Index { record }) => {
                        index.insert(record);
                    }
                    Ok(Op::Delete { id }) => {
                        index.remove(&id);
                    }
                    Err(e) => {
                        warn!(line = lineno + 1, error = %e, "Skipping corrupt index log entry");
                        corrupt += 1;
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let committed = file.metadata()?.len();
        let mut log = OpLog {
            path,
            file,
            entries,
            committed,
        };
        if corrupt > 0 {
            log.rewrite(index)?;
        }
        Ok(log)
    }

    /// Appends `ops` and syncs them to disk as one unit. A failed write is
    /// truncated away so the next append starts on a fresh line.
    fn append(&mut self, ops: &[Op]) -> Result<(), StorageError> {
        let mut data = Vec::new();
        for op in ops {
            serde_json::to_writer(&mut data, op)?;
            data.push(b'\n');
        }

        let len = self.file.metadata()?.len();
        if len != self.committed {
            warn!(
                len,
                committed = self.committed,
                "Discarding partially written index log entry"
            );
            self.file.set_len(self.committed)?;
        }

        let written = self
            .file
            .write_all(&data)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            if let Err(truncate) = self.file.set_len(self.committed) {
                error!(error = %truncate, "Unable to discard partial index log write");
            }
            return Err(e.into());
        }

        self.committed += data.len() as u64;
        self.entries += ops.len();
        Ok(())
    }

    fn needs_compaction(&self, live: usize) -> bool {
        self.entries.saturating_sub(live) > live
    }

    /// Replaces the log with one `index` entry per live record.
    fn rewrite(&mut self, index: &MemoryIndex) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            let mut data = Vec::new();
            for record in index.records() {
                serde_json::to_writer(
                    &mut data,
                    &Op::Index {
                        record: record.clone(),
                    },
                )?;
                data.push(b'\n');
            }
            out.write_all(&data)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed = self.file.metadata()?.len();
        self.entries = index.len();
        Ok(())
    }
}

struct Shared {
    index: RwLock<MemoryIndex>,
    /// `None` once the index has been closed.
    log: Mutex<Option<OpLog>>,
}

impl Shared {
    fn apply(&self, ops: Vec<Op>) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let mut log = self.log.lock().expect("lock poisoned");
        let log = log
            .as_mut()
            .ok_or_else(|| StorageError::Backend("index is closed".to_string()))?;
        log.append(&ops)?;

        #[allow(clippy::expect_used)]
        let mut index = self.index.write().expect("lock poisoned");
        for op in ops {
            match op {
                Op::Index { record } => {
                    index.insert(record);
                }
                Op::Delete { id } => {
                    index.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn compact(&self) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let mut log = self.log.lock().expect("lock poisoned");
        let Some(log) = log.as_mut() else {
            return Ok(());
        };
        #[allow(clippy::expect_used)]
        let index = self.index.read().expect("lock poisoned");
        if log.needs_compaction(index.len()) {
            let before = log.entries;
            log.rewrite(&index)?;
            debug!(before, after = log.entries, "Index log compacted");
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        #[allow(clippy::expect_used)]
        let mut log = self.log.lock().expect("lock poisoned");
        if let Some(log) = log.take() {
            log.file.sync_all()?;
        }
        Ok(())
    }
}

/// Handle on the persisted index, shared by the flusher and the cleaner.
pub struct EmbeddedIndex {
    shared: Arc<Shared>,
}

impl EmbeddedIndex {
    async fn blocking<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&Shared) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || f(&shared))
            .await
            .map_err(|e| StorageError::Backend(format!("index task failed: {e}")))?
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.blocking(Shared::close).await
    }
}

#[async_trait]
impl BatchWriter for EmbeddedIndex {
    async fn write_batch(&self, batch: &[LogRecord]) -> Result<(), StorageError> {
        let ops = batch
            .iter()
            .map(|record| Op::Index {
                record: record.clone(),
            })
            .collect();
        self.blocking(move |shared| shared.apply(ops)).await
    }
}

#[async_trait]
impl RetentionTarget for EmbeddedIndex {
    async fn expired_page(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        #[allow(clippy::expect_used)]
        let index = self.shared.index.read().expect("lock poisoned");
        Ok(index.expired(cutoff, limit))
    }

    async fn delete_batch(&self, ids: &[String]) -> Result<(), StorageError> {
        let ops = ids.iter().map(|id| Op::Delete { id: id.clone() }).collect();
        self.blocking(move |shared| shared.apply(ops)).await
    }

    async fn compact(&self) -> Result<(), StorageError> {
        self.blocking(Shared::compact).await
    }
}

pub struct EmbeddedStorage {
    index: Arc<EmbeddedIndex>,
    buffer: Arc<PendingBuffer>,
    flush: FlushSettings,
    retention: RetentionSettings,
}

fn open_dir(datapath: &Path) -> Result<Shared, StorageError> {
    if let Some(parent) = datapath.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(StorageError::Backend(format!(
                "parent directory of {} does not exist",
                datapath.display()
            )));
        }
    }
    if !datapath.is_dir() {
        fs::create_dir(datapath)?;
    }

    let mut index = MemoryIndex::default();
    let log = OpLog::open(datapath, &mut index)?;
    Ok(Shared {
        index: RwLock::new(index),
        log: Mutex::new(Some(log)),
    })
}

impl EmbeddedStorage {
    pub async fn open(config: EmbeddedConfig) -> Result<Self, StorageError> {
        let datapath = config.datapath.clone();
        let shared = tokio::task::spawn_blocking(move || open_dir(&datapath))
            .await
            .map_err(|e| StorageError::Backend(format!("index task failed: {e}")))??;

        let nb_messages = {
            #[allow(clippy::expect_used)]
            let index = shared.index.read().expect("lock poisoned");
            index.len()
        };
        info!(path = %config.datapath.display(), nb_messages, "Embedded index opened");

        Ok(EmbeddedStorage {
            index: Arc::new(EmbeddedIndex {
                shared: Arc::new(shared),
            }),
            buffer: Arc::new(PendingBuffer::new(config.flush.max_pending)),
            flush: config.flush,
            retention: config.retention,
        })
    }
}

#[async_trait]
impl Storage for EmbeddedStorage {
    async fn lookup_by_id(&self, id: &str) -> Result<Map<String, Value>, StorageError> {
        let id = id.to_string();
        self.index
            .blocking(move |shared| {
                #[allow(clippy::expect_used)]
                let index = shared.index.read().expect("lock poisoned");
                let record = index.get(&id).ok_or(StorageError::NotFound)?;
                match serde_json::to_value(record)? {
                    Value::Object(doc) => Ok(doc),
                    _ => Err(StorageError::Backend(format!(
                        "document {id} is not an object"
                    ))),
                }
            })
            .await
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError> {
        let started = Instant::now();
        let parsed = query::parse(query.query.trim()).map_err(StorageError::InvalidQuery)?;
        let offset = usize::try_from(query.offset).unwrap_or(0);
        let limit = usize::try_from(query.limit).unwrap_or(0);
        let (from, to) = (query.from, query.to);

        let (total, messages) = self
            .index
            .blocking(move |shared| {
                #[allow(clippy::expect_used)]
                let index = shared.index.read().expect("lock poisoned");
                let hits = index.search(&parsed, from, to, offset, limit);
                let messages: Vec<LogRecord> = hits.records.into_iter().cloned().collect();
                Ok((hits.total, messages))
            })
            .await?;

        Ok(SearchResult {
            total,
            took_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            limit: query.limit,
            offset: query.offset,
            messages,
        })
    }

    fn enqueue(&self, record: LogRecord) {
        self.buffer.push(record);
    }

    async fn run_flush_loop(&self, cancel: CancellationToken) {
        let flusher = Flusher::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.index),
            self.flush,
        );
        let cleaner = RetentionCleaner::new(Arc::clone(&self.index), self.retention);
        tokio::join!(flusher.run(cancel.clone()), cleaner.run(cancel));

        match self.index.close().await {
            Ok(()) => info!("Embedded index closed"),
            Err(e) => error!(error = %e, "Unable to close embedded index"),
        }
    }

    async fn validate_query_syntax(&self, query: &str) -> Result<(), StorageError> {
        query::parse(query)
            .map(|_| ())
            .map_err(StorageError::InvalidQuery)
    }

    fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}
