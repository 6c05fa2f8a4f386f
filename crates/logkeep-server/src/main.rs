// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, error, info};

use logkeep::coordinator::Coordinator;
use logkeep::http::QueryServer;
use logkeep::receiver::Receiver;
use logkeep::source::GelfUdpSource;
use logkeep::storage;

mod config;
mod logger;

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            // logging is not set up yet
            eprintln!("{}: {e}", logger::TAG);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logger::init(&config.log_level, config.syslog.as_ref()) {
        eprintln!("{}: {e}", logger::TAG);
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let storage = match storage::build(config.storage.clone()).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Unable to initialize storage: {e}");
            return ExitCode::FAILURE;
        }
    };

    let source = match GelfUdpSource::bind(&config.receiver.addr).await {
        Ok(source) => source,
        Err(e) => {
            error!("Unable to listen on {}: {e}", config.receiver.addr);
            return ExitCode::FAILURE;
        }
    };

    let mut coordinator = Coordinator::default();

    let server = match QueryServer::bind(
        config.http.clone(),
        Arc::clone(&storage),
        coordinator.token(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Unable to start query server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let receiver = Receiver::new(
        Box::new(source),
        Arc::clone(&storage),
        config.receiver.read_timeout,
        coordinator.token(),
    );
    coordinator.spawn("receiver", receiver.spin());

    let flush_storage = Arc::clone(&storage);
    let token = coordinator.storage_token();
    coordinator.spawn_storage("flush", async move {
        flush_storage.run_flush_loop(token).await;
    });

    let token = coordinator.token();
    coordinator.spawn("http", async move {
        if let Err(e) = server.serve().await {
            error!("Query server stopped: {e}");
            token.cancel();
        }
    });

    info!(
        receiver = %config.receiver.addr,
        http = %config.http.addr,
        "logkeep started"
    );

    let reason = coordinator.wait_for_shutdown().await;
    debug!(?reason, "Shutting down");
    coordinator.shutdown().await;

    ExitCode::SUCCESS
}
