// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::time::Instant;

use crate::errors::ReceiveError;
use crate::record::GelfMessage;

pub mod gelf;

pub use gelf::GelfUdpSource;

/// Yields decoded inbound messages one at a time.
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next complete message until `deadline`.
    ///
    /// Returns [`ReceiveError::Timeout`] when nothing complete arrived in time.
    async fn receive(&mut self, deadline: Instant) -> Result<GelfMessage, ReceiveError>;
}
