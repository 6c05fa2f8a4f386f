// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion worker: drains a message source into storage.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ReceiveError;
use crate::record::LogRecord;
use crate::source::MessageSource;
use crate::storage::Storage;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Receiver {
    source: Box<dyn MessageSource>,
    storage: Arc<dyn Storage>,
    read_timeout: Duration,
    cancel_token: CancellationToken,
}

impl Receiver {
    #[must_use]
    pub fn new(
        source: Box<dyn MessageSource>,
        storage: Arc<dyn Storage>,
        read_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Receiver {
            source,
            storage,
            read_timeout,
            cancel_token,
        }
    }

    /// Receives until cancelled. Shutdown latency is bounded by one read
    /// timeout.
    pub async fn spin(mut self) {
        info!("Receiver started");
        while !self.cancel_token.is_cancelled() {
            self.consume_one().await;
        }
        info!("Receiver stopped");
    }

    async fn consume_one(&mut self) {
        let deadline = Instant::now() + self.read_timeout;
        match self.source.receive(deadline).await {
            Ok(msg) => {
                let record = LogRecord::from_gelf(msg);
                self.storage.enqueue(record);
            }
            Err(ReceiveError::Timeout) => debug!("No message received before read deadline"),
            Err(e) => warn!(error = %e, "Unable to receive message"),
        }
    }
}
