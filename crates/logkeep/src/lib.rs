// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GELF log ingestion with batched writes to a searchable store.
//!
//! The crate wires three kinds of long-running loops around one shared
//! [`storage::Storage`] implementation:
//!
//! - the [`receiver::Receiver`] drains a [`source::MessageSource`] and enqueues records,
//! - the storage flush loop pushes pending records to the backend in batches
//!   (and, for the embedded backend, runs the retention cleaner),
//! - the [`http::QueryServer`] serves dump and search requests.
//!
//! The loops observe the cancellation tokens owned by the
//! [`coordinator::Coordinator`], which stops ingestion before the final flush.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod coordinator;
pub mod errors;
pub mod http;
pub mod receiver;
pub mod record;
pub mod source;
pub mod storage;
