/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use catalog_views::BucketCount;
use catalog_views::Config;
use std::net::ToSocketAddrs;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct ConfigManager {
    config_tx: watch::Sender<Arc<Config>>,
}

impl ConfigManager {
    /// Create a new ConfigManager and return both the manager and a receiver for configuration
    /// change notifications. The receiver can be cloned to share with multiple consumers.
    ///
    /// After creating the ConfigManager, call `start()` from within a Tokio runtime context
    /// to begin listening for SIGHUP signals.
    pub fn new(config: Config) -> (Self, watch::Receiver<Arc<Config>>) {
        let (config_tx, config_rx) = watch::channel(Arc::new(config));
        (Self { config_tx }, config_rx)
    }

    /// Start listening for SIGHUP signals in a background task.
    /// Must be called from within a Tokio runtime context (e.g., inside catalog_views::block_on).
    pub fn start<F>(self, env: F)
    where
        F: Fn(&'static str) -> Result<String, std::env::VarError> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            self.handle_sighup(env).await;
        });
    }

    /// Reload configuration from environment variables and notify all watchers.
    pub async fn reload_config<F>(&self, env: F) -> anyhow::Result<()>
    where
        F: Fn(&'static str) -> Result<String, std::env::VarError>,
    {
        let old_config = self.config_tx.borrow().clone();
        let new_config = Arc::new(load_config(env).await?);

        self.check_restart_required_changes(&old_config, &new_config);

        // watch notifies all receivers
        self.config_tx.send(new_config)?;

        tracing::info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Log changes which take effect only after a restart.
    fn check_restart_required_changes(&self, old_config: &Config, new_config: &Config) {
        let mut changes = Vec::new();

        if old_config.disable_colors != new_config.disable_colors {
            changes.push(format!(
                "Log coloring disabled: {} -> {}",
                old_config.disable_colors, new_config.disable_colors
            ));
        }

        if old_config.threads != new_config.threads {
            changes.push(format!(
                "Thread count: {:?} -> {:?}",
                old_config.threads, new_config.threads
            ));
        }

        if !changes.is_empty() {
            tracing::warn!(
                "Configuration changes detected that require server restart:\n  {}",
                changes.join("\n  ")
            );
        }
    }

    /// Reload configuration on every SIGHUP. Exits when there are no more configuration
    /// receivers.
    pub async fn handle_sighup<F>(self, env: F)
    where
        F: Fn(&'static str) -> Result<String, std::env::VarError>,
    {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(sighup) => sighup,
                Err(err) => {
                    tracing::error!("Unable to install SIGHUP handler: {err}");
                    return;
                }
            };

        // Check receiver count periodically to allow loop exit even without SIGHUP
        let mut check_interval = tokio::time::interval(Duration::from_secs(1));
        check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("Received SIGHUP signal, reloading configuration...");

                    if let Err(err) = dotenvy::from_filename_override(".env") {
                        tracing::debug!("No .env file found or error reading it: {err}");
                    }

                    if let Err(err) = self.reload_config(&env).await {
                        tracing::error!("Failed to reload configuration: {err:#}");
                    }
                }
                _ = check_interval.tick() => {
                    if self.config_tx.receiver_count() == 0 {
                        tracing::debug!("No more configuration receivers, stopping SIGHUP handler");
                        break;
                    }
                }
            }
        }
    }
}

async fn credentials<F>(env: &F) -> anyhow::Result<Option<catalog_views::Credentials>>
where
    F: Fn(&'static str) -> Result<String, std::env::VarError>,
{
    const USERNAME_ENV: &str = "CATALOG_VIEWS_SCYLLADB_USERNAME";
    const PASS_FILE_ENV: &str = "CATALOG_VIEWS_SCYLLADB_PASSWORD_FILE";

    let Ok(username) = env(USERNAME_ENV) else {
        tracing::debug!("No credentials configured, connecting without authentication");
        return Ok(None);
    };
    tracing::debug!("{USERNAME_ENV} = {username}");
    if username.is_empty() {
        bail!("credentials: {USERNAME_ENV} must not be empty");
    }

    let Ok(password_file) = env(PASS_FILE_ENV) else {
        bail!("credentials: {PASS_FILE_ENV} env required when {USERNAME_ENV} is set");
    };
    let password = tokio::fs::read_to_string(&password_file)
        .await
        .map_err(|e| anyhow!("credentials: failed to read password file: {e}"))?;

    Ok(Some(catalog_views::Credentials {
        username,
        password: secrecy::SecretString::new(password.trim().into()),
    }))
}

fn duration<F>(env: &F, key: &'static str) -> anyhow::Result<Option<Duration>>
where
    F: Fn(&'static str) -> Result<String, std::env::VarError>,
{
    env(key)
        .ok()
        .map(|v| {
            v.trim()
                .parse::<humantime::Duration>()
                .with_context(|| format!("Unable to parse {key} env (duration, e.g. 5m)"))
        })
        .transpose()
        .map(|v| v.map(Into::into))
}

fn non_zero<F>(env: &F, key: &'static str) -> anyhow::Result<Option<NonZeroUsize>>
where
    F: Fn(&'static str) -> Result<String, std::env::VarError>,
{
    env(key)
        .ok()
        .map(|v| {
            v.trim()
                .parse()
                .with_context(|| format!("Unable to parse {key} env (positive integer)"))
        })
        .transpose()
}

pub async fn load_config<F>(env: F) -> anyhow::Result<Config>
where
    F: Fn(&'static str) -> Result<String, std::env::VarError>,
{
    let mut config = Config::default();

    if let Some(disable_colors) = env("CATALOG_VIEWS_DISABLE_COLORS")
        .ok()
        .map(|v| {
            v.trim().parse().or(Err(anyhow!(
                "Unable to parse CATALOG_VIEWS_DISABLE_COLORS env (true/false)"
            )))
        })
        .transpose()?
    {
        config.disable_colors = disable_colors;
    }

    if let Some(catalog_views_addr) = env("CATALOG_VIEWS_URI")
        .ok()
        .map(|v| {
            v.to_socket_addrs()
                .map_err(|_| anyhow!("Unable to parse CATALOG_VIEWS_URI env (host:port)"))?
                .next()
                .ok_or(anyhow!("Unable to parse CATALOG_VIEWS_URI env (host:port)"))
        })
        .transpose()?
    {
        config.catalog_views_addr = catalog_views_addr;
    }

    if let Ok(scylladb_uri) = env("CATALOG_VIEWS_SCYLLADB_URI") {
        config.scylladb_uri = scylladb_uri;
    }

    if let Ok(keyspace) = env("CATALOG_VIEWS_KEYSPACE") {
        if keyspace.is_empty() {
            bail!("CATALOG_VIEWS_KEYSPACE must not be empty");
        }
        config.keyspace = keyspace.into();
    }

    if let Ok(source_table) = env("CATALOG_VIEWS_SOURCE_TABLE") {
        if source_table.is_empty() {
            bail!("CATALOG_VIEWS_SOURCE_TABLE must not be empty");
        }
        config.source_table = source_table.into();
    }

    if let Some(threads) = env("CATALOG_VIEWS_THREADS")
        .ok()
        .map(|v| v.parse())
        .transpose()?
    {
        config.threads = Some(threads);
    }

    config.credentials = credentials(&env).await?;

    config.cql_keepalive_interval = duration(&env, "CATALOG_VIEWS_CQL_KEEPALIVE_INTERVAL")?;
    config.cql_keepalive_timeout = duration(&env, "CATALOG_VIEWS_CQL_KEEPALIVE_TIMEOUT")?;

    if let Some(bucket_count) = env("CATALOG_VIEWS_DEFAULT_BUCKET_COUNT")
        .ok()
        .map(|v| v.trim().parse::<u32>())
        .transpose()?
    {
        if !(1..=BucketCount::MAX).contains(&bucket_count) {
            bail!(
                "CATALOG_VIEWS_DEFAULT_BUCKET_COUNT must be between 1 and {}",
                BucketCount::MAX
            );
        }
        config.default_bucket_count = bucket_count.into();
    }

    if let Some(scan_page_size) = non_zero(&env, "CATALOG_VIEWS_SCAN_PAGE_SIZE")? {
        config.scan_page_size = scan_page_size;
    }

    if let Some(progress_flush_rows) = non_zero(&env, "CATALOG_VIEWS_PROGRESS_FLUSH_ROWS")? {
        config.progress_flush_rows = progress_flush_rows;
    }

    if let Some(similar_cache_ttl) = duration(&env, "CATALOG_VIEWS_SIMILAR_CACHE_TTL")? {
        config.similar_cache_ttl = similar_cache_ttl;
    }

    if let Some(similar_cache_capacity) = env("CATALOG_VIEWS_SIMILAR_CACHE_CAPACITY")
        .ok()
        .map(|v| v.trim().parse())
        .transpose()?
    {
        config.similar_cache_capacity = similar_cache_capacity;
    }

    Ok(config)
}
