// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors returned by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested document does not exist.
    #[error("message not found")]
    NotFound,

    /// The query string was rejected by the backend.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The backend answered but reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Errors returned by a [`crate::source::MessageSource`].
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// No complete message arrived before the read deadline.
    #[error("read deadline reached")]
    Timeout,

    #[error("unable to read from socket: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram arrived but could not be turned into a message.
    #[error("unable to decode message: {0}")]
    Decode(String),
}

impl ReceiveError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Errors from the HTTP query worker.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
