// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server configuration.
//!
//! Values come from a YAML file (`LOGKEEP_CONFIG`, default
//! `/etc/logkeep/config.yaml`, optional) overridden by `LOGKEEP_` environment
//! variables, with `__` separating sections: `LOGKEEP_HTTP__ADDR` sets
//! `http.addr`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use logkeep::http::{Limits, QueryConfig, DEFAULT_MAX_PER_PAGE, DEFAULT_MAX_RESULTS};
use logkeep::receiver::DEFAULT_READ_TIMEOUT;
use logkeep::storage::elastic::ElasticConfig;
use logkeep::storage::embedded::EmbeddedConfig;
use logkeep::storage::StorageConfig;
use serde::{Deserialize, Deserializer};
use tracing::error;

use crate::logger::SyslogLevel;

pub const CONFIG_PATH_ENV: &str = "LOGKEEP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/logkeep/config.yaml";
const ENV_PREFIX: &str = "LOGKEEP_";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("unable to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverSettings {
    pub addr: String,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyslogConfig {
    /// `udp`, `tcp`, or empty for the local syslog socket.
    pub proto: String,
    pub addr: String,
    pub level: SyslogLevel,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub receiver: ReceiverSettings,
    pub http: QueryConfig,
    pub storage: StorageConfig,
    pub syslog: Option<SyslogConfig>,
}

/// Parses Go-style durations such as `500ms`, `1h30m` or `1.5s`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input == "0" {
        return Some(Duration::ZERO);
    }
    if input.is_empty() {
        return None;
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).ok()
}

fn deserialize_optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration such as 1s, 500ms or 1h30m")
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let parsed = parse_duration(v);
            if parsed.is_none() {
                error!("Failed to parse duration {v:?}, using default");
            }
            Ok(parsed)
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            if v == 0 {
                return Ok(Some(Duration::ZERO));
            }
            error!("Failed to parse duration {v}: missing unit, using default");
            Ok(None)
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            error!("Failed to parse duration {v}: missing unit, using default");
            Ok(None)
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            error!("Failed to parse duration {v}: missing unit, using default");
            Ok(None)
        }
        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReceiverSection {
    addr: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    read_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpSection {
    addr: Option<String>,
    max_per_page: Option<i64>,
    max_results: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StorageSection {
    backend: Option<String>,
    max_pending: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ElasticSection {
    url: Option<String>,
    index: Option<String>,
    #[serde(rename = "type")]
    type_name: Option<String>,
    batch_size: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    interval_flush: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    interval_cleanup: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmbeddedSection {
    datapath: Option<PathBuf>,
    batch_size: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    interval_flush: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    interval_cleanup: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SyslogSection {
    proto: String,
    addr: String,
    level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    log_level: Option<String>,
    receiver: ReceiverSection,
    http: HttpSection,
    storage: StorageSection,
    elastic: ElasticSection,
    embedded: EmbeddedSection,
    syslog: Option<SyslogSection>,
}

fn required(value: Option<String>, key: &str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Invalid(format!("{key} is required"))),
    }
}

fn positive_or(value: Option<i64>, default: i64) -> i64 {
    value.filter(|v| *v > 0).unwrap_or(default)
}

impl FileConfig {
    fn resolve(self) -> Result<Config, ConfigError> {
        let receiver = ReceiverSettings {
            addr: required(self.receiver.addr, "receiver.addr")?,
            read_timeout: self
                .receiver
                .read_timeout
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_READ_TIMEOUT),
        };

        let http = QueryConfig {
            addr: required(self.http.addr, "http.addr")?,
            limits: Limits {
                max_per_page: positive_or(self.http.max_per_page, DEFAULT_MAX_PER_PAGE),
                max_results: positive_or(self.http.max_results, DEFAULT_MAX_RESULTS),
            },
        };
        if http.limits.max_results < http.limits.max_per_page {
            return Err(ConfigError::Invalid(format!(
                "http.max_results ({}) must not be lower than http.max_per_page ({})",
                http.limits.max_results, http.limits.max_per_page
            )));
        }

        let backend = required(self.storage.backend, "storage.backend")?;
        let storage = match backend.trim().to_lowercase().as_str() {
            "elastic" => {
                let section = self.elastic;
                let mut config = ElasticConfig::new(
                    required(section.url, "elastic.url")?,
                    required(section.index, "elastic.index")?,
                    required(section.type_name, "elastic.type")?,
                );
                apply_flush(
                    &mut config.flush,
                    self.storage.max_pending,
                    section.batch_size,
                    section.interval_flush,
                );
                if let Some(ttl) = section.interval_cleanup {
                    config.ttl = ttl;
                }
                if let Some(timeout) = section.timeout {
                    config.timeout = timeout;
                }
                StorageConfig::Elastic(config)
            }
            "embedded" => {
                let section = self.embedded;
                let datapath = section
                    .datapath
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| ConfigError::Invalid("embedded.datapath is required".into()))?;
                let mut config = EmbeddedConfig::new(datapath);
                apply_flush(
                    &mut config.flush,
                    self.storage.max_pending,
                    section.batch_size,
                    section.interval_flush,
                );
                if let Some(window) = section.interval_cleanup {
                    config.retention.window = window;
                }
                StorageConfig::Embedded(config)
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown storage.backend {other:?}, expected \"elastic\" or \"embedded\""
                )));
            }
        };

        let syslog = self.syslog.map(|section| SyslogConfig {
            proto: section.proto.trim().to_lowercase(),
            addr: section.addr.trim().to_string(),
            level: section
                .level
                .as_deref()
                .map(SyslogLevel::from_name)
                .unwrap_or_default(),
        });

        Ok(Config {
            log_level: self
                .log_level
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            receiver,
            http,
            storage,
            syslog,
        })
    }
}

fn apply_flush(
    flush: &mut logkeep::storage::flusher::FlushSettings,
    max_pending: Option<usize>,
    batch_size: Option<usize>,
    interval: Option<Duration>,
) {
    if let Some(max_pending) = max_pending.filter(|n| *n > 0) {
        flush.max_pending = max_pending;
    }
    if let Some(batch_size) = batch_size.filter(|n| *n > 0) {
        flush.batch_size = batch_size;
    }
    if let Some(interval) = interval {
        flush.flush_interval = interval;
    }
}

/// Loads the configuration from the file named by `LOGKEEP_CONFIG` and the
/// environment.
pub fn load() -> Result<Config, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(Path::new(&path))
}

pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let file: FileConfig = Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    file.resolve()
}
