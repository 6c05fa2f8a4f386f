// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON query API.
//!
//! | route                | method | answer                      |
//! |----------------------|--------|-----------------------------|
//! | `/api/dump/{id}`     | GET    | stored document             |
//! | `/api/search/`       | POST   | one page of search results  |
//! | `/api/health`        | GET    | pending buffer statistics   |
//!
//! Every answer is `{"status":"ok","data":...}` or
//! `{"status":"error","message":...}`.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ServerError, StorageError};
use crate::record::SearchQuery;
use crate::storage::Storage;

pub const MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_PER_PAGE: i64 = 100;
pub const DEFAULT_MAX_RESULTS: i64 = 1000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const DUMP_PREFIX: &str = "/api/dump/";
const MESSAGE_NOT_FOUND: &str = "Message not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_per_page: i64,
    pub max_results: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_per_page: DEFAULT_MAX_PER_PAGE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Logs `message` and wraps it in an error body with the given status.
fn log_and_create_error_response(message: &str, status: StatusCode) -> Response<Full<Bytes>> {
    if status.is_server_error() {
        error!("{message}");
    } else {
        debug!("{message}");
    }
    json_response(status, &json!({"status": "error", "message": message}))
}

fn ok_response<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    match serde_json::to_value(data) {
        Ok(data) => json_response(StatusCode::OK, &json!({"status": "ok", "data": data})),
        Err(e) => log_and_create_error_response(
            &format!("Unable to encode response: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

fn storage_error_response(context: &str, err: &StorageError) -> Response<Full<Bytes>> {
    let status = match err {
        StorageError::NotFound => StatusCode::NOT_FOUND,
        StorageError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    log_and_create_error_response(&format!("{context}: {err}"), status)
}

/// Rejects bodies whose declared length exceeds `max_content_length`.
fn verify_request_content_length(
    headers: &HeaderMap,
    max_content_length: usize,
) -> Option<Response<Full<Bytes>>> {
    let declared = headers.get(header::CONTENT_LENGTH)?;
    let length: Option<usize> = declared.to_str().ok().and_then(|v| v.parse().ok());
    match length {
        Some(length) if length > max_content_length => Some(log_and_create_error_response(
            "Payload too large",
            StatusCode::PAYLOAD_TOO_LARGE,
        )),
        Some(_) => None,
        None => Some(log_and_create_error_response(
            "Invalid Content-Length header",
            StatusCode::BAD_REQUEST,
        )),
    }
}

/// Routes one request. Generic over the body so tests can drive it directly.
pub async fn handle_request<B>(
    storage: &dyn Storage,
    limits: Limits,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if let Some(id) = path.strip_prefix(DUMP_PREFIX) {
        if method != Method::GET {
            return method_not_allowed(&method, &path);
        }
        return dump(storage, id).await;
    }

    match path.as_str() {
        "/api/dump" => {
            if method != Method::GET {
                return method_not_allowed(&method, &path);
            }
            dump(storage, "").await
        }
        "/api/search" | "/api/search/" => {
            if method != Method::POST {
                return method_not_allowed(&method, &path);
            }
            search(storage, limits, req).await
        }
        "/api/health" => {
            if method != Method::GET {
                return method_not_allowed(&method, &path);
            }
            ok_response(&storage.stats())
        }
        _ => log_and_create_error_response(&format!("No route for {path}"), StatusCode::NOT_FOUND),
    }
}

fn method_not_allowed(method: &Method, path: &str) -> Response<Full<Bytes>> {
    log_and_create_error_response(
        &format!("Method {method} not allowed on {path}"),
        StatusCode::METHOD_NOT_ALLOWED,
    )
}

async fn dump(storage: &dyn Storage, id: &str) -> Response<Full<Bytes>> {
    if id.is_empty() {
        return log_and_create_error_response(MESSAGE_NOT_FOUND, StatusCode::NOT_FOUND);
    }
    match storage.lookup_by_id(id).await {
        Ok(doc) => ok_response(&doc),
        Err(StorageError::NotFound) => {
            log_and_create_error_response(MESSAGE_NOT_FOUND, StatusCode::NOT_FOUND)
        }
        Err(e) => storage_error_response("Unable to dump message", &e),
    }
}

async fn search<B>(storage: &dyn Storage, limits: Limits, req: Request<B>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if let Some(response) = verify_request_content_length(req.headers(), MAX_BODY_SIZE) {
        return response;
    }

    let body = match Limited::new(req.into_body(), MAX_BODY_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return log_and_create_error_response(
                "Payload too large",
                StatusCode::PAYLOAD_TOO_LARGE,
            );
        }
        Err(e) => {
            return log_and_create_error_response(
                &format!("Unable to read request body: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let mut query: SearchQuery = match serde_json::from_slice(&body) {
        Ok(query) => query,
        Err(e) => {
            return log_and_create_error_response(
                &format!("Unable to parse search request: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    query.query = query.query.trim().to_string();
    if !query.query.is_empty() {
        if let Err(e) = storage.validate_query_syntax(&query.query).await {
            return storage_error_response("Invalid query", &e);
        }
    }
    query.clamp(limits.max_per_page, limits.max_results);

    match storage.search(&query).await {
        Ok(result) => ok_response(&result),
        Err(e) => storage_error_response("Unable to search messages", &e),
    }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub addr: String,
    pub limits: Limits,
}

/// HTTP/1 server for the query API.
pub struct QueryServer {
    listener: TcpListener,
    storage: Arc<dyn Storage>,
    limits: Limits,
    cancel_token: CancellationToken,
}

impl QueryServer {
    pub async fn bind(
        config: QueryConfig,
        storage: Arc<dyn Storage>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.addr).await.map_err(|source| ServerError::Bind {
            addr: config.addr.clone(),
            source,
        })?;
        Ok(QueryServer {
            listener,
            storage,
            limits: config.limits,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until cancelled, then gives in-flight connections
    /// a short grace period.
    pub async fn serve(self) -> Result<(), ServerError> {
        let storage = self.storage;
        let limits = self.limits;
        let service = service_fn(move |req: Request<Incoming>| {
            let storage = Arc::clone(&storage);
            async move { Ok::<_, Infallible>(handle_request(storage.as_ref(), limits, req).await) }
        });

        info!(addr = %self.listener.local_addr()?, "Query server listening");
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                () = self.cancel_token.cancelled() => break,
            };

            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            let cancel = self.cancel_token.clone();
            joinset.spawn(async move {
                let conn = server.serve_connection(conn, service);
                tokio::pin!(conn);
                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    () = cancel.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    debug!("Connection error: {e}");
                }
            });
        }

        debug!(
            connections = joinset.len(),
            "Query server draining connections"
        );
        let drain = async { while joinset.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Query server shutdown grace period elapsed, aborting connections");
            joinset.abort_all();
        }
        info!("Query server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogRecord, SearchResult};
    use crate::storage::BufferStats;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockStorage {
        validations: AtomicUsize,
        searches: Mutex<Vec<SearchQuery>>,
        fail_search: bool,
    }

    #[async_trait]
    impl Storage for MockStorage {
        async fn lookup_by_id(&self, id: &str) -> Result<Map<String, Value>, StorageError> {
            match id {
                "known" => Ok(json!({"host": "h1", "short_message": "boot ok"})
                    .as_object()
                    .cloned()
                    .unwrap()),
                "broken" => Err(StorageError::Backend("connection refused".into())),
                _ => Err(StorageError::NotFound),
            }
        }

        async fn search(&self, query: &SearchQuery) -> Result<SearchResult, StorageError> {
            if self.fail_search {
                return Err(StorageError::Backend("503".into()));
            }
            self.searches.lock().unwrap().push(query.clone());
            Ok(SearchResult {
                total: 0,
                took_ms: 1,
                limit: query.limit,
                offset: query.offset,
                messages: Vec::<LogRecord>::new(),
            })
        }

        fn enqueue(&self, _record: LogRecord) {}

        async fn run_flush_loop(&self, _cancel: CancellationToken) {}

        async fn validate_query_syntax(&self, query: &str) -> Result<(), StorageError> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            if query.contains('"') {
                Err(StorageError::InvalidQuery("unterminated quote".into()))
            } else {
                Ok(())
            }
        }

        fn stats(&self) -> BufferStats {
            BufferStats {
                pending: 3,
                dropped: 1,
                last_flush_failed: true,
            }
        }
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn call(storage: &MockStorage, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
        let response = handle_request(storage, Limits::default(), req).await;
        let status = response.status();
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_dump_known_id() {
        let storage = MockStorage::default();
        let (status, body) = call(&storage, request(Method::GET, "/api/dump/known", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["data"]["host"], "h1");
    }

    #[tokio::test]
    async fn test_dump_not_found_and_backend_errors() {
        let storage = MockStorage::default();
        let (status, body) = call(&storage, request(Method::GET, "/api/dump/nope", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({"status": "error", "message": "Message not found"})
        );

        let (status, _) = call(&storage, request(Method::GET, "/api/dump/", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&storage, request(Method::GET, "/api/dump/broken", "")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_empty_query_skips_validation() {
        let storage = MockStorage::default();
        let (status, body) = call(
            &storage,
            request(Method::POST, "/api/search/", r#"{"query":"   "}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["limit"], 100);
        assert_eq!(storage.validations.load(Ordering::SeqCst), 0);
        assert_eq!(storage.searches.lock().unwrap()[0].query, "");
    }

    #[tokio::test]
    async fn test_search_validates_and_clamps() {
        let storage = MockStorage::default();
        let (status, body) = call(
            &storage,
            request(
                Method::POST,
                "/api/search",
                r#"{"query":" host:h1 ","limit":50,"offset":990}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["offset"], 950);
        assert_eq!(storage.validations.load(Ordering::SeqCst), 1);
        assert_eq!(storage.searches.lock().unwrap()[0].query, "host:h1");
    }

    #[tokio::test]
    async fn test_invalid_query_is_bad_request() {
        let storage = MockStorage::default();
        let (status, body) = call(
            &storage,
            request(Method::POST, "/api/search/", r#"{"query":"host:\"h1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("unterminated quote"));
        assert!(storage.searches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_body_is_bad_request() {
        let storage = MockStorage::default();
        let (status, _) = call(&storage, request(Method::POST, "/api/search/", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_backend_failure() {
        let storage = MockStorage {
            fail_search: true,
            ..Default::default()
        };
        let (status, _) = call(&storage, request(Method::POST, "/api/search/", "{}")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_declared_oversized_body_is_rejected() {
        let storage = MockStorage::default();
        let mut req = request(Method::POST, "/api/search/", "{}");
        req.headers_mut().insert(
            header::CONTENT_LENGTH,
            HeaderValue::from(MAX_BODY_SIZE + 1),
        );
        let (status, _) = call(&storage, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_routing_errors() {
        let storage = MockStorage::default();
        let (status, _) = call(&storage, request(Method::GET, "/api/search/", "")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = call(&storage, request(Method::POST, "/api/dump/known", "")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let (status, _) = call(&storage, request(Method::GET, "/api/unknown", "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_reports_buffer_stats() {
        let storage = MockStorage::default();
        let (status, body) = call(&storage, request(Method::GET, "/api/health", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["data"],
            json!({"pending": 3, "dropped": 1, "last_flush_failed": true})
        );
    }

    #[tokio::test]
    async fn test_server_answers_and_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let server = QueryServer::bind(
            QueryConfig {
                addr: "127.0.0.1:0".into(),
                limits: Limits::default(),
            },
            Arc::new(MockStorage::default()),
            cancel.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.serve());

        let response = reqwest::get(format!("http://{addr}/api/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["cache-control"], "no-cache");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["pending"], 3);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_names_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = QueryServer::bind(
            QueryConfig {
                addr: addr.clone(),
                limits: Limits::default(),
            },
            Arc::new(MockStorage::default()),
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains(&addr));
    }
}
