// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide shutdown coordination.
//!
//! Tasks are split in two stages. Ingest tasks (receivers, the query server)
//! observe [`Coordinator::token`] and stop first. Storage tasks observe
//! [`Coordinator::storage_token`], which is only cancelled once every ingest
//! task has returned, so their final flush sees everything accepted before
//! shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Why [`Coordinator::wait_for_shutdown`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The token was cancelled from inside the process.
    Requested,
    /// Ctrl-C / SIGINT.
    UserInterrupt,
    /// SIGTERM.
    Terminated,
    /// Signal handlers could not be installed.
    SignalError,
}

type Tasks = Vec<(&'static str, JoinHandle<()>)>;

pub struct Coordinator {
    cancel_token: CancellationToken,
    storage_token: CancellationToken,
    tasks: Tasks,
    storage_tasks: Tasks,
    shutdown_timeout: Duration,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl Coordinator {
    #[must_use]
    pub fn new(shutdown_timeout: Duration) -> Self {
        Coordinator {
            cancel_token: CancellationToken::new(),
            storage_token: CancellationToken::new(),
            tasks: Vec::new(),
            storage_tasks: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Token to hand to an ingest loop at construction. Cancelling it
    /// requests a shutdown.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Token for flush loops. Cancelled after all ingest tasks have stopped.
    #[must_use]
    pub fn storage_token(&self) -> CancellationToken {
        self.storage_token.clone()
    }

    /// Spawns an ingest task, stopped in the first shutdown stage.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawning task");
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Spawns a storage task, stopped once the ingest tasks are done.
    pub fn spawn_storage<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Spawning storage task");
        self.storage_tasks.push((name, tokio::spawn(task)));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len() + self.storage_tasks.len()
    }

    /// Blocks until an interrupt arrives or the token is cancelled.
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        tokio::select! {
            () = self.cancel_token.cancelled() => {
                info!("Shutdown requested via cancellation token");
                ShutdownReason::Requested
            }
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Received Ctrl+C, initiating shutdown");
                    ShutdownReason::UserInterrupt
                }
                Err(e) => {
                    error!("Failed to listen for Ctrl+C: {e}");
                    ShutdownReason::SignalError
                }
            },
            reason = terminate() => reason,
        }
    }

    /// Stops ingest tasks, then storage tasks, aborting whatever is still
    /// running once the shutdown timeout has elapsed.
    pub async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        self.cancel_token.cancel();
        info!("Waiting for {} ingest tasks to complete", self.tasks.len());
        drain(std::mem::take(&mut self.tasks), deadline).await;

        self.storage_token.cancel();
        info!(
            "Waiting for {} storage tasks to complete",
            self.storage_tasks.len()
        );
        drain(std::mem::take(&mut self.storage_tasks), deadline).await;

        info!("Shutdown complete");
    }
}

async fn drain(tasks: Tasks, deadline: tokio::time::Instant) {
    for (name, mut handle) in tasks {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            warn!(task = name, "Shutdown timeout exceeded, aborting task");
            handle.abort();
            continue;
        }

        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(())) => debug!(task = name, "Task completed"),
            Ok(Err(e)) => error!(task = name, "Task failed: {e}"),
            Err(_) => {
                warn!(task = name, "Task timed out, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(unix)]
async fn terminate() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
            info!("Received SIGTERM, initiating shutdown");
            ShutdownReason::Terminated
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {e}");
            ShutdownReason::SignalError
        }
    }
}

#[cfg(not(unix))]
async fn terminate() -> ShutdownReason {
    std::future::pending().await
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.storage_token.cancel();
        for (_, handle) in self.tasks.iter().chain(&self.storage_tasks) {
            handle.abort();
        }
    }
}
