/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use anyhow::anyhow;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
mod config_manager;
mod info;

use config_manager::ConfigManager;

#[derive(Parser)]
#[clap(version)]
struct Args {}

fn dotenvy_to_std_var(key: &'static str) -> Result<String, std::env::VarError> {
    dotenvy::var(key).map_err(|_| std::env::VarError::NotPresent)
}

fn main() -> anyhow::Result<()> {
    // Initialize logging early, before loading configuration, disable colors will be read twice
    let disable_colors: bool = dotenvy::var("CATALOG_VIEWS_DISABLE_COLORS")
        .unwrap_or("false".to_string())
        .trim()
        .parse()
        .or(Err(anyhow!(
            "Unable to parse CATALOG_VIEWS_DISABLE_COLORS env (true/false)"
        )))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?)
        .with(fmt::layer().with_target(false).with_ansi(!disable_colors))
        .init();

    _ = dotenvy::dotenv();

    let loaded_config = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(config_manager::load_config(dotenvy_to_std_var))?;

    _ = Args::parse();

    tracing::info!(
        "Starting {} version {}",
        info::Info::name(),
        info::Info::version()
    );

    let (config_manager, config_rx) = ConfigManager::new(loaded_config);
    let threads = config_rx.borrow().threads;

    catalog_views::block_on(threads, async move || {
        // Start SIGHUP handler now that we're in the Tokio runtime
        config_manager.start(dotenvy_to_std_var);

        let db_actor = catalog_views::new_db(config_rx.clone()).await?;

        let (_server_actor, addr) = catalog_views::run(db_actor, config_rx).await?;
        tracing::info!("listening on {addr}");

        catalog_views::wait_for_shutdown().await;

        anyhow::Ok(())
    })?;

    Ok(())
}
