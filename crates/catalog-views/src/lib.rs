/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

mod backfill;
pub mod cursor;
pub mod db;
mod engine;
pub mod error;
pub mod httproutes;
mod httpserver;
mod info;
pub mod jobs;
pub mod partition;
pub mod similarity;
mod similarity_cache;
pub mod sort_spec;
mod topk;

use db::Db;
use scylla::cluster::metadata::ColumnType;
use scylla::serialize::SerializationError;
use scylla::serialize::value::SerializeValue;
use scylla::serialize::writers::CellWriter;
use scylla::serialize::writers::WrittenCellProof;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Config {
    pub catalog_views_addr: SocketAddr,
    pub scylladb_uri: String,
    pub keyspace: KeyspaceName,
    pub source_table: TableName,
    pub threads: Option<usize>,
    pub credentials: Option<Credentials>,
    pub cql_keepalive_interval: Option<Duration>,
    pub cql_keepalive_timeout: Option<Duration>,
    pub disable_colors: bool,
    pub default_bucket_count: BucketCount,
    pub scan_page_size: NonZeroUsize,
    pub progress_flush_rows: NonZeroUsize,
    pub similar_cache_ttl: Duration,
    pub similar_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog_views_addr: SocketAddr::from(([127, 0, 0, 1], 6090)),
            scylladb_uri: "127.0.0.1:9042".to_string(),
            keyspace: "catalog".into(),
            source_table: "artists".into(),
            threads: None,
            credentials: None,
            cql_keepalive_interval: None,
            cql_keepalive_timeout: None,
            disable_colors: false,
            default_bucket_count: BucketCount::default(),
            scan_page_size: NonZeroUsize::new(500).unwrap(),
            progress_flush_rows: NonZeroUsize::new(250).unwrap(),
            similar_cache_ttl: Duration::from_secs(300),
            similar_cache_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: secrecy::SecretString,
}

#[derive(
    Clone,
    Debug,
    Eq,
    Hash,
    PartialEq,
    derive_more::AsRef,
    derive_more::Display,
    derive_more::From,
    serde::Deserialize,
    serde::Serialize,
    utoipa::ToSchema,
)]
#[from(String, &String, &str)]
#[as_ref(str)]
/// A keyspace name in a db.
pub struct KeyspaceName(String);

#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::AsRef,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    utoipa::ToSchema,
)]
#[from(String, &String, &str)]
#[as_ref(str)]
/// A name of a table in a db.
pub struct TableName(String);

impl SerializeValue for TableName {
    fn serialize<'b>(
        &self,
        typ: &ColumnType,
        writer: CellWriter<'b>,
    ) -> Result<WrittenCellProof<'b>, SerializationError> {
        <String as SerializeValue>::serialize(&self.0, typ, writer)
    }
}

#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::AsRef,
    serde::Serialize,
    serde::Deserialize,
    derive_more::Display,
    utoipa::ToSchema,
)]
#[from(String, &String, &str)]
#[as_ref(str)]
/// Primary key of an artist in the source table.
pub struct ArtistId(String);

impl SerializeValue for ArtistId {
    fn serialize<'b>(
        &self,
        typ: &ColumnType,
        writer: CellWriter<'b>,
    ) -> Result<WrittenCellProof<'b>, SerializationError> {
        <String as SerializeValue>::serialize(&self.0, typ, writer)
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    derive_more::From,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
    utoipa::ToSchema,
)]
/// Opaque identifier of a build job.
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    derive_more::From,
    derive_more::Display,
    serde::Serialize,
    serde::Deserialize,
    utoipa::ToSchema,
)]
/// Number of synthetic partitions a numeric derived table is spread over.
pub struct BucketCount(u32);

impl BucketCount {
    pub const MAX: u32 = 1024;

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for BucketCount {
    fn default() -> Self {
        Self(16)
    }
}

#[derive(
    Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, utoipa::ToSchema,
)]
/// A single image of an artist.
pub struct Image {
    pub url: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    serde::Serialize,
    serde::Deserialize,
    derive_more::AsRef,
    derive_more::From,
    utoipa::ToSchema,
)]
/// An embedding vector stored with an artist.
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq)]
/// A row of the source table.
pub struct SourceRow {
    pub id: ArtistId,
    pub name: Option<String>,
    pub sortable_name: Option<String>,
    pub followers: Option<i64>,
    pub popularity: Option<i32>,
    pub images: Vec<Image>,
    pub embedding: Option<Embedding>,
}

impl SourceRow {
    pub fn new(id: impl Into<ArtistId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            sortable_name: None,
            followers: None,
            popularity: None,
            images: Vec::new(),
            embedding: None,
        }
    }

    pub fn image_url(&self) -> Option<String> {
        self.images.first().map(|image| image.url.clone())
    }
}

pub fn block_on<Output>(threads: Option<usize>, f: impl AsyncFnOnce() -> Output) -> Output {
    let mut builder = match threads {
        Some(0) | None => Builder::new_multi_thread(),
        Some(1) => Builder::new_current_thread(),
        Some(threads) => {
            let mut builder = Builder::new_multi_thread();
            builder.worker_threads(threads);
            builder
        }
    };
    builder
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { f().await })
}

pub async fn run(
    db_actor: Sender<Db>,
    config_rx: watch::Receiver<Arc<Config>>,
) -> anyhow::Result<(impl Sized, SocketAddr)> {
    httpserver::new(engine::new(db_actor, config_rx.clone()), config_rx).await
}

pub async fn new_db(config_rx: watch::Receiver<Arc<Config>>) -> anyhow::Result<Sender<Db>> {
    db::new(config_rx).await
}

// yield between pages of a full scan, scoring is cpu bound and would otherwise starve other
// tasks on the same worker
async fn move_to_the_end_of_async_runtime_queue() {
    task::yield_now().await;
}

pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
