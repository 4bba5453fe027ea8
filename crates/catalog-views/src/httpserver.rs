/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::Config;
use crate::engine::Engine;
use crate::httproutes;
use axum_server::Handle;
use axum_server::accept::NoDelayAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::time;
use tracing::error;
use tracing::info;
use tracing::warn;

pub(crate) enum HttpServer {}

const MAX_RETRIES: u32 = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Retry spawning a server with exponential backoff
async fn spawn_server_with_retry(
    addr: SocketAddr,
    engine: Sender<Engine>,
) -> anyhow::Result<(Handle, SocketAddr)> {
    let mut retry_delay = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match spawn_server(addr, engine.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) if attempt < MAX_RETRIES => {
                warn!(
                    "failed to start HTTP server (attempt {attempt}/{MAX_RETRIES}): {err}, retrying in {retry_delay:?}"
                );
                time::sleep(retry_delay).await;
                // 50ms, 100ms, 200ms, ... up to 2s
                retry_delay = (retry_delay * 2).min(Duration::from_secs(2));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Starts the HTTP server and a supervisor restarting it when the listen address changes. The
/// server lives as long as the returned sender.
pub(crate) async fn new(
    engine: Sender<Engine>,
    mut config_rx: watch::Receiver<Arc<Config>>,
) -> anyhow::Result<(Sender<HttpServer>, SocketAddr)> {
    // minimal size as channel is used as a lifetime guard
    const CHANNEL_SIZE: usize = 1;
    let (tx, mut rx) = mpsc::channel(CHANNEL_SIZE);

    let initial_addr = config_rx.borrow().catalog_views_addr;
    let (initial_handle, actual_addr) =
        spawn_server_with_retry(initial_addr, engine.clone()).await?;
    info!("HTTP server listening on {actual_addr}");

    tokio::spawn(async move {
        let mut current_handle = initial_handle;
        let mut current_addr = initial_addr;

        loop {
            tokio::select! {
                result = rx.recv() => {
                    if result.is_none() {
                        break;
                    }
                }
                result = config_rx.changed() => {
                    if result.is_err() {
                        break;
                    }

                    let new_addr = config_rx.borrow().catalog_views_addr;
                    if new_addr == current_addr {
                        continue;
                    }

                    info!("HTTP server address changed {current_addr} -> {new_addr}, reloading");
                    current_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

                    match spawn_server_with_retry(new_addr, engine.clone()).await {
                        Ok((handle, actual_addr)) => {
                            current_handle = handle;
                            current_addr = new_addr;
                            info!("HTTP server reloaded on {actual_addr}");
                        }
                        Err(err) => {
                            error!("HTTP server is offline, unable to start it on {new_addr}: {err}");
                        }
                    }
                }
            }
        }

        info!("HTTP server shutting down");
        current_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        // Brief delay to allow clean shutdown
        time::sleep(Duration::from_millis(100)).await;
    });

    Ok((tx, actual_addr))
}

/// Returns the handle and the actual bound address.
async fn spawn_server(
    addr: SocketAddr,
    engine: Sender<Engine>,
) -> anyhow::Result<(Handle, SocketAddr)> {
    let handle = Handle::new();

    tokio::spawn({
        let handle = handle.clone();
        async move {
            axum_server::bind(addr)
                .handle(handle)
                .acceptor(NoDelayAcceptor::new())
                .serve(httproutes::new(engine).into_make_service())
                .await
                .unwrap_or_else(|err| error!("HTTP server on {addr} failed: {err}"));
        }
    });

    // Add timeout to prevent hanging forever if server fails to start
    let actual_addr = time::timeout(Duration::from_secs(5), handle.listening())
        .await
        .map_err(|_| anyhow::anyhow!("timeout waiting for server to start"))?
        .ok_or(anyhow::anyhow!(
            "server failed to start - listening notification not received"
        ))?;

    Ok((handle, actual_addr))
}
