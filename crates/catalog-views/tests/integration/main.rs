/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

mod builds;
mod db_basic;
mod info;
mod openapi;
mod similar;

use catalog_views::Config;
use catalog_views::db::Db;
use httpclient::HttpClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task;
use tokio::time;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

static INIT_TRACING: Once = Once::new();

fn enable_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::registry()
            .with(EnvFilter::try_new("info").unwrap())
            .with(fmt::layer().with_target(false))
            .init();
    });
}

/// Starts the service on an ephemeral port over the given storage. The returned guards keep the
/// server and its configuration alive.
async fn run_service(
    db_actor: Sender<Db>,
    config: Config,
) -> (HttpClient, impl Sized, watch::Sender<Arc<Config>>) {
    let config = Config {
        catalog_views_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..config
    };
    let (config_tx, config_rx) = watch::channel(Arc::new(config));

    let (server, addr) = catalog_views::run(db_actor, config_rx).await.unwrap();
    (HttpClient::new(addr), server, config_tx)
}

async fn wait_for_value<T>(mut producer: impl AsyncFnMut() -> Option<T>, msg: &str) -> T {
    time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = producer().await {
                break value;
            }
            task::yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timeout on: {msg}"))
}
