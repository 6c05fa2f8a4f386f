// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log records and the query/result types exchanged with storage backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// A stored log record.
///
/// `id` stays empty until a backend persists the record and is never changed
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub short_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub full_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub facility: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub line: i32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl LogRecord {
    /// Builds a record from a decoded GELF message.
    ///
    /// The GELF timestamp is truncated to whole seconds; a missing or
    /// out-of-range timestamp is replaced by the current time.
    pub fn from_gelf(msg: GelfMessage) -> Self {
        let timestamp = msg
            .timestamp
            .filter(|ts| ts.is_finite())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.trunc() as i64, 0))
            .unwrap_or_else(Utc::now);

        LogRecord {
            id: String::new(),
            version: msg.version,
            host: msg.host,
            short_message: msg.short_message,
            full_message: msg.full_message,
            timestamp,
            level: msg.level,
            facility: msg.facility,
            file: msg.file,
            line: msg.line,
            extra: msg.extra,
        }
    }

    pub fn is_persisted(&self) -> bool {
        !self.id.is_empty()
    }
}

/// A decoded GELF message as delivered by the message source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GelfMessage {
    pub version: String,
    pub host: String,
    pub short_message: String,
    pub full_message: String,
    /// Seconds since the unix epoch, fractional part allowed.
    pub timestamp: Option<f64>,
    pub level: i32,
    pub facility: String,
    pub file: String,
    pub line: i32,
    /// Additional `_`-prefixed fields, keys kept verbatim.
    pub extra: Map<String, Value>,
}

impl GelfMessage {
    /// Builds a message from a parsed GELF JSON object.
    ///
    /// `version`, `host` and `short_message` are mandatory. Numeric fields
    /// sent as strings are accepted, as several GELF clients do so.
    pub fn from_json_object(mut object: Map<String, Value>) -> Result<Self, String> {
        let version = take_string(&mut object, "version")
            .ok_or_else(|| "missing 'version' field".to_string())?;
        let host =
            take_string(&mut object, "host").ok_or_else(|| "missing 'host' field".to_string())?;
        let short_message = take_string(&mut object, "short_message")
            .ok_or_else(|| "missing 'short_message' field".to_string())?;

        let full_message = take_string(&mut object, "full_message").unwrap_or_default();
        let timestamp = object.remove("timestamp").and_then(|v| as_f64(&v));
        let level = object
            .remove("level")
            .and_then(|v| as_f64(&v))
            .map_or(1, |v| v as i32);
        let facility = take_string(&mut object, "facility").unwrap_or_default();
        let file = take_string(&mut object, "file").unwrap_or_default();
        let line = object
            .remove("line")
            .and_then(|v| as_f64(&v))
            .map_or(0, |v| v as i32);

        let extra = object
            .into_iter()
            .filter(|(key, _)| key.starts_with('_') && key != "_id")
            .collect();

        Ok(GelfMessage {
            version,
            host,
            short_message,
            full_message,
            timestamp,
            level,
            facility,
            file,
            line,
            extra,
        })
    }
}

fn take_string(object: &mut Map<String, Value>, key: &str) -> Option<String> {
    match object.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Search request as received from the query API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl SearchQuery {
    /// Rewrites limit and offset so the request stays inside the allowed window.
    ///
    /// An out-of-range limit becomes `max_per_page`. A negative offset becomes
    /// zero; an offset whose page would end past `max_results` is pulled back
    /// to `max_results - limit` (never below zero).
    pub fn clamp(&mut self, max_per_page: i64, max_results: i64) {
        if self.limit <= 0 || self.limit > max_per_page {
            self.limit = max_per_page;
        }

        if self.offset < 0 {
            self.offset = 0;
        } else if self.offset + self.limit > max_results {
            self.offset = (max_results - self.limit).max(0);
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub total: u64,
    pub took_ms: u64,
    pub limit: i64,
    pub offset: i64,
    /// Ordered by timestamp, newest first.
    pub messages: Vec<LogRecord>,
}
