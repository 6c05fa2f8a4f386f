// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch backend.
//!
//! Records are written with the `_bulk` API and expire through a per-document
//! TTL, so this backend runs no retention cleaner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::StorageError;
use crate::record::{LogRecord, SearchQuery, SearchResult};
use crate::storage::buffer::{BufferStats, PendingBuffer};
use crate::storage::flusher::{BatchWriter, FlushSettings, Flusher};
use crate::storage::retention::DEFAULT_RETENTION;
use crate::storage::Storage;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ElasticConfig {
    pub url: String,
    pub index: String,
    pub type_name: String,
    pub flush: FlushSettings,
    /// Lifetime of a document, sent as its `_ttl`.
    pub ttl: Duration,
    pub timeout: Duration,
}

impl ElasticConfig {
    pub fn new(url: String, index: String, type_name: String) -> Self {
        ElasticConfig {
            url,
            index,
            type_name,
            flush: FlushSettings::default(),
            ttl: DEFAULT_RETENTION,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct ElasticClient {
    http: reqwest::Client,
    base: Url,
    index: String,
    type_name: String,
    ttl_ms: u128,
}

#[derive(Serialize)]
struct BulkAction<'a> {
    index: BulkTarget<'a>,
}

#[derive(Serialize)]
struct BulkTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type")]
    type_name: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_ttl")]
    ttl: String,
}

impl ElasticClient {
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| StorageError::Backend(format!("invalid base url: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn doc_endpoint(&self, suffix: &[&str]) -> Result<Url, StorageError> {
        let mut segments = vec![self.index.as_str(), self.type_name.as_str()];
        segments.extend_from_slice(suffix);
        self.endpoint(&segments)
    }

    async fn lookup(&self, id: &str) -> Result<Map<String, Value>, StorageError> {
        let response = self.http.get(self.doc_endpoint(&[id])?).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound);
        }
        if !status.is_success() {
            return Err(StorageError::Backend(format!("lookup returned {status}")));
        }

        let mut body: Value = response.json().await?;
        if body.get("found").and_then(Value::as_bool) == Some(false) {
            return Err(StorageError::NotFound);
        }
        match body.get_mut("_source").map(Value::take) {
            Some(Value::Object(source)) => Ok(source),
            _ => Err(StorageError::NotFound),
        }
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError> {
        let response = self
            .http
            .post(self.doc_endpoint(&["_search"])?)
            .json(&search_body(query))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Backend(format!("search returned {status}")));
        }

        let body: Value = response.json().await?;
        let hits = &body["hits"];
        let total = hits["total"]
            .as_u64()
            .or_else(|| hits["total"]["value"].as_u64())
            .unwrap_or(0);

        let mut messages = Vec::new();
        for hit in hits["hits"].as_array().into_iter().flatten() {
            match serde_json::from_value::<LogRecord>(hit["_source"].clone()) {
                Ok(mut record) => {
                    if let Some(id) = hit["_id"].as_str() {
                        record.id = id.to_string();
                    }
                    messages.push(record);
                }
                Err(e) => debug!(error = %e, "Skipping undecodable search hit"),
            }
        }

        Ok(SearchResult {
            total,
            took_ms: body["took"].as_u64().unwrap_or(0),
            limit: query.limit,
            offset: query.offset,
            messages,
        })
    }

    async fn validate(&self, query: &str) -> Result<(), StorageError> {
        let response = self
            .http
            .get(self.doc_endpoint(&["_validate", "query"])?)
            .query(&[("q", query)])
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            return Err(StorageError::InvalidQuery(query.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Backend(format!("validate returned {status}")));
        }

        let body: Value = response.json().await?;
        if body["valid"].as_bool().unwrap_or(false) {
            Ok(())
        } else {
            Err(StorageError::InvalidQuery(query.to_string()))
        }
    }

    fn bulk_body(&self, batch: &[LogRecord]) -> Result<String, StorageError> {
        let mut body = String::new();
        for record in batch {
            let action = BulkAction {
                index: BulkTarget {
                    index: &self.index,
                    type_name: &self.type_name,
                    id: &record.id,
                    ttl: format!("{}ms", self.ttl_ms),
                },
            };
            body.push_str(&serde_json::to_string(&action)?);
            body.push('\n');

            // the id travels in the action line only
            let mut source = serde_json::to_value(record)?;
            if let Value::Object(fields) = &mut source {
                fields.remove("id");
            }
            body.push_str(&serde_json::to_string(&source)?);
            body.push('\n');
        }
        Ok(body)
    }
}

fn search_body(query: &SearchQuery) -> Value {
    let mut filter = Vec::new();
    let text = query.query.trim();
    if text.is_empty() {
        filter.push(json!({"match_all": {}}));
    } else {
        filter.push(json!({"query_string": {"query": text}}));
    }

    if query.from.is_some() || query.to.is_some() {
        let mut range = Map::new();
        if let Some(from) = query.from {
            range.insert("gte".to_string(), json!(from));
        }
        if let Some(to) = query.to {
            range.insert("lte".to_string(), json!(to));
        }
        filter.push(json!({"range": {"timestamp": range}}));
    }

    json!({
        "query": {"bool": {"filter": filter}},
        "sort": [{"timestamp": {"order": "desc"}}],
        "from": query.offset,
        "size": query.limit,
    })
}

fn count_indexed(response: &Value) -> usize {
    response["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object()?.values().next()?["status"].as_u64())
                .filter(|status| (200..300).contains(status))
                .count()
        })
        .unwrap_or(0)
}

#[async_trait]
impl BatchWriter for ElasticClient {
    async fn write_batch(&self, batch: &[LogRecord]) -> Result<(), StorageError> {
        let response = self
            .http
            .post(self.endpoint(&["_bulk"])?)
            .header("Content-Type", "application/x-ndjson")
            .body(self.bulk_body(batch)?)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Backend(format!(
                "bulk write returned {status}"
            )));
        }

        let body: Value = response.json().await?;
        let nb_created = count_indexed(&body);
        if nb_created != batch.len() {
            warn!(
                nb_messages = batch.len(),
                nb_created, "Not all messages were indexed"
            );
        }
        Ok(())
    }
}

pub struct ElasticStorage {
    client: Arc<ElasticClient>,
    buffer: Arc<PendingBuffer>,
    flush: FlushSettings,
}

impl ElasticStorage {
    pub fn new(config: ElasticConfig) -> Result<Self, StorageError> {
        let base = Url::parse(&config.url)
            .map_err(|e| StorageError::Backend(format!("invalid url {}: {e}", config.url)))?;
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(ElasticStorage {
            client: Arc::new(ElasticClient {
                http,
                base,
                index: config.index,
                type_name: config.type_name,
                ttl_ms: config.ttl.as_millis(),
            }),
            buffer: Arc::new(PendingBuffer::new(config.flush.max_pending)),
            flush: config.flush,
        })
    }
}

#[async_trait]
impl Storage for ElasticStorage {
    async fn lookup_by_id(&self, id: &str) -> Result<Map<String, Value>, StorageError> {
        self.client.lookup(id).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError> {
        self.client.search(query).await
    }

    fn enqueue(&self, record: LogRecord) {
        self.buffer.push(record);
    }

    async fn run_flush_loop(&self, cancel: CancellationToken) {
        Flusher::new(
            Arc::clone(&self.buffer),
            Arc::clone(&self.client),
            self.flush,
        )
        .run(cancel)
        .await;
    }

    async fn validate_query_syntax(&self, query: &str) -> Result<(), StorageError> {
        self.client.validate(query).await
    }

    fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server};
    use tracing_test::traced_test;

    fn storage(url: String) -> ElasticStorage {
        let mut config = ElasticConfig::new(url, "logkeep".into(), "message".into());
        config.ttl = Duration::from_secs(3600);
        config.timeout = Duration::from_secs(5);
        ElasticStorage::new(config).unwrap()
    }

    fn record(id: &str, host: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            version: "1.1".to_string(),
            host: host.to_string(),
            short_message: "boot ok".to_string(),
            full_message: String::new(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            level: 6,
            facility: String::new(),
            file: String::new(),
            line: 0,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_lookup_returns_source() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/logkeep/message/abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"_id":"abc","found":true,"_source":{"host":"h1","short_message":"boot ok"}}"#,
            )
            .create_async()
            .await;

        let doc = storage(server.url()).lookup_by_id("abc").await.unwrap();
        assert_eq!(doc["host"], "h1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_lookup_unknown_id_is_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/logkeep/message/missing")
            .with_status(404)
            .with_body(r#"{"_id":"missing","found":false}"#)
            .create_async()
            .await;

        let err = storage(server.url())
            .lookup_by_id("missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_backend_failure_is_not_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/logkeep/message/abc")
            .with_status(503)
            .create_async()
            .await;

        let err = storage(server.url()).lookup_by_id("abc").await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_search_body_match_all_without_range() {
        let body = search_body(&SearchQuery {
            query: "  ".into(),
            limit: 20,
            offset: 40,
            ..Default::default()
        });
        assert_eq!(
            body,
            json!({
                "query": {"bool": {"filter": [{"match_all": {}}]}},
                "sort": [{"timestamp": {"order": "desc"}}],
                "from": 40,
                "size": 20,
            })
        );
    }

    #[test]
    fn test_search_body_query_string_with_one_sided_range() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let body = search_body(&SearchQuery {
            query: "host:h1".into(),
            limit: 10,
            offset: 0,
            from: Some(from),
            to: None,
        });
        let filter = &body["query"]["bool"]["filter"];
        assert_eq!(filter[0], json!({"query_string": {"query": "host:h1"}}));
        assert_eq!(
            filter[1],
            json!({"range": {"timestamp": {"gte": "2024-01-01T00:00:00Z"}}})
        );
    }

    #[tokio::test]
    async fn test_search_decodes_hits() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logkeep/message/_search")
            .match_body(Matcher::PartialJson(json!({"from": 0, "size": 10})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "took": 7,
                    "hits": {
                        "total": {"value": 2, "relation": "eq"},
                        "hits": [
                            {"_id": "id-1", "_source": {
                                "version": "1.1", "host": "h1", "short_message": "boot ok",
                                "timestamp": "2024-05-01T12:00:00Z", "level": 6
                            }},
                            {"_id": "id-2", "_source": {"host": "h1"}}
                        ]
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let result = storage(server.url())
            .search(&SearchQuery {
                query: "h1".into(),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.total, 2);
        assert_eq!(result.took_ms, 7);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].id, "id-1");
        assert_eq!(result.messages[0].host, "h1");
    }

    #[tokio::test]
    async fn test_validate_query() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/logkeep/message/_validate/query")
            .match_query(Matcher::UrlEncoded("q".into(), "host:h1".into()))
            .with_status(200)
            .with_body(r#"{"valid":true}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/logkeep/message/_validate/query")
            .match_query(Matcher::UrlEncoded("q".into(), "host:(".into()))
            .with_status(200)
            .with_body(r#"{"valid":false}"#)
            .create_async()
            .await;

        let storage = storage(server.url());
        assert!(storage.validate_query_syntax("host:h1").await.is_ok());
        let err = storage.validate_query_syntax("host:(").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_bulk_write_sends_ndjson_with_ids_and_ttl() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/_bulk")
            .match_header("content-type", "application/x-ndjson")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(
                    r#"\{"index":\{"_index":"logkeep","_type":"message","_id":"id-1","_ttl":"3600000ms"\}\}"#
                        .into(),
                ),
                Matcher::Regex(r#""_id":"id-2""#.into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"took":3,"errors":false,"items":[{"index":{"_id":"id-1","status":201}},{"index":{"_id":"id-2","status":201}}]}"#,
            )
            .create_async()
            .await;

        let storage = storage(server.url());
        storage
            .client
            .write_batch(&[record("id-1", "h1"), record("id-2", "h2")])
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bulk_partial_success_is_logged_but_accepted() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/_bulk")
            .with_status(200)
            .with_body(
                r#"{"errors":true,"items":[{"index":{"_id":"id-1","status":201}},{"index":{"_id":"id-2","status":429}}]}"#,
            )
            .create_async()
            .await;

        let storage = storage(server.url());
        let result = storage
            .client
            .write_batch(&[record("id-1", "h1"), record("id-2", "h2")])
            .await;
        assert!(result.is_ok());
        assert!(logs_contain("Not all messages were indexed"));
    }

    #[tokio::test]
    async fn test_bulk_server_error_fails_batch() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/_bulk")
            .with_status(500)
            .create_async()
            .await;

        let storage = storage(server.url());
        let result = storage.client.write_batch(&[record("id-1", "h1")]).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }

    #[tokio::test]
    async fn test_flush_loop_writes_enqueued_records_on_shutdown() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/_bulk")
            .match_body(Matcher::Regex("boot ok".into()))
            .with_status(200)
            .with_body(r#"{"items":[{"index":{"status":201}}]}"#)
            .expect(1)
            .create_async()
            .await;

        let storage = Arc::new(storage(server.url()));
        storage.enqueue(record("", "h1"));
        assert_eq!(storage.stats().pending, 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        storage.run_flush_loop(cancel).await;

        mock.assert_async().await;
        assert_eq!(storage.stats().pending, 0);
    }
}
