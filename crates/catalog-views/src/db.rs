/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::ArtistId;
use crate::Config;
use crate::Credentials;
use crate::Image;
use crate::KeyspaceName;
use crate::SourceRow;
use crate::TableName;
use crate::cursor::PageState;
use crate::cursor::SourcePage;
use crate::partition::DerivedRow;
use crate::partition::DerivedTableMeta;
use crate::partition::TableShape;
use anyhow::Context;
use itertools::Itertools;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::PagingState;
use scylla::response::PagingStateResponse;
use scylla::statement::prepared::PreparedStatement;
use scylla::value::Row;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tap::Pipe;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::Instrument;
use tracing::debug;
use tracing::error_span;
use tracing::info;
use tracing::trace;
use tracing::warn;

type SourceCountR = anyhow::Result<u64>;
type ScanSourceR = anyhow::Result<SourcePage>;
type GetArtistR = anyhow::Result<Option<SourceRow>>;
type CreateDerivedTableR = anyhow::Result<()>;
type TruncateDerivedTableR = anyhow::Result<()>;
type PutDerivedMetaR = anyhow::Result<()>;
type GetDerivedMetaR = anyhow::Result<Option<DerivedTableMeta>>;
type InsertDerivedRowR = anyhow::Result<()>;
type QueryDerivedR = anyhow::Result<Vec<DerivedRow>>;

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub enum Db {
    /// Approximate number of rows in the source table.
    SourceCount {
        tx: oneshot::Sender<SourceCountR>,
    },

    ScanSource {
        page_size: NonZeroUsize,
        page_state: Option<PageState>,
        tx: oneshot::Sender<ScanSourceR>,
    },

    GetArtist {
        id: ArtistId,
        tx: oneshot::Sender<GetArtistR>,
    },

    CreateDerivedTable {
        shape: Arc<TableShape>,
        tx: oneshot::Sender<CreateDerivedTableR>,
    },

    TruncateDerivedTable {
        table: TableName,
        tx: oneshot::Sender<TruncateDerivedTableR>,
    },

    PutDerivedMeta {
        meta: DerivedTableMeta,
        tx: oneshot::Sender<PutDerivedMetaR>,
    },

    GetDerivedMeta {
        table: TableName,
        tx: oneshot::Sender<GetDerivedMetaR>,
    },

    InsertDerivedRow {
        shape: Arc<TableShape>,
        row: DerivedRow,
        tx: oneshot::Sender<InsertDerivedRowR>,
    },

    /// Reads up to `limit` rows of a derived table in clustering order. Numeric layouts read a
    /// single bucket.
    QueryDerived {
        shape: Arc<TableShape>,
        bucket: Option<i32>,
        limit: usize,
        tx: oneshot::Sender<QueryDerivedR>,
    },
}

pub(crate) trait DbExt {
    async fn source_count(&self) -> SourceCountR;

    async fn scan_source(
        &self,
        page_size: NonZeroUsize,
        page_state: Option<PageState>,
    ) -> ScanSourceR;

    async fn get_artist(&self, id: ArtistId) -> GetArtistR;

    async fn create_derived_table(&self, shape: Arc<TableShape>) -> CreateDerivedTableR;

    async fn truncate_derived_table(&self, table: TableName) -> TruncateDerivedTableR;

    async fn put_derived_meta(&self, meta: DerivedTableMeta) -> PutDerivedMetaR;

    async fn get_derived_meta(&self, table: TableName) -> GetDerivedMetaR;

    async fn insert_derived_row(&self, shape: Arc<TableShape>, row: DerivedRow)
    -> InsertDerivedRowR;

    async fn query_derived(
        &self,
        shape: Arc<TableShape>,
        bucket: Option<i32>,
        limit: usize,
    ) -> QueryDerivedR;
}

impl DbExt for mpsc::Sender<Db> {
    async fn source_count(&self) -> SourceCountR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::SourceCount { tx }).await?;
        rx.await?
    }

    async fn scan_source(
        &self,
        page_size: NonZeroUsize,
        page_state: Option<PageState>,
    ) -> ScanSourceR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::ScanSource {
            page_size,
            page_state,
            tx,
        })
        .await?;
        rx.await?
    }

    async fn get_artist(&self, id: ArtistId) -> GetArtistR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::GetArtist { id, tx }).await?;
        rx.await?
    }

    async fn create_derived_table(&self, shape: Arc<TableShape>) -> CreateDerivedTableR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::CreateDerivedTable { shape, tx }).await?;
        rx.await?
    }

    async fn truncate_derived_table(&self, table: TableName) -> TruncateDerivedTableR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::TruncateDerivedTable { table, tx }).await?;
        rx.await?
    }

    async fn put_derived_meta(&self, meta: DerivedTableMeta) -> PutDerivedMetaR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::PutDerivedMeta { meta, tx }).await?;
        rx.await?
    }

    async fn get_derived_meta(&self, table: TableName) -> GetDerivedMetaR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::GetDerivedMeta { table, tx }).await?;
        rx.await?
    }

    async fn insert_derived_row(
        &self,
        shape: Arc<TableShape>,
        row: DerivedRow,
    ) -> InsertDerivedRowR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::InsertDerivedRow { shape, row, tx }).await?;
        rx.await?
    }

    async fn query_derived(
        &self,
        shape: Arc<TableShape>,
        bucket: Option<i32>,
        limit: usize,
    ) -> QueryDerivedR {
        let (tx, rx) = oneshot::channel();
        self.send(Db::QueryDerived {
            shape,
            bucket,
            limit,
            tx,
        })
        .await?;
        rx.await?
    }
}

pub(crate) async fn new(
    mut config_rx: watch::Receiver<Arc<Config>>,
) -> anyhow::Result<mpsc::Sender<Db>> {
    let (tx, mut rx) = mpsc::channel(10);
    tokio::spawn(
        async move {
            let mut config = config_rx.borrow().clone();
            let mut reconnect_timer = interval(RECONNECT_TIMEOUT);
            let mut statements: Option<Arc<Statements>> = None;

            loop {
                tokio::select! {
                    _ = reconnect_timer.tick() => {
                        if statements.is_none() {
                            match connect(&config).await {
                                Ok(connected) => {
                                    statements = Some(Arc::new(connected));
                                    info!("Connected to ScyllaDB at {}", config.scylladb_uri);
                                }
                                Err(e) => {
                                    tracing::error!(
                                        "Failed to connect to ScyllaDB (error: {e:#}) at {}, retrying in {}s",
                                        config.scylladb_uri,
                                        RECONNECT_TIMEOUT.as_secs()
                                    );
                                }
                            }
                        }
                    }

                    result = config_rx.changed() => {
                        if result.is_ok() {
                            let new_config = config_rx.borrow_and_update().clone();

                            let uri_changed = new_config.scylladb_uri != config.scylladb_uri;
                            let tables_changed = new_config.keyspace != config.keyspace
                                || new_config.source_table != config.source_table;
                            let credentials_changed = match (&new_config.credentials, &config.credentials) {
                                (None, None) => false,
                                (Some(_), None) | (None, Some(_)) => true,
                                (Some(new_creds), Some(old_creds)) => {
                                    new_creds.username != old_creds.username
                                        // SecretString doesn't implement PartialEq
                                        || new_creds.password.expose_secret() != old_creds.password.expose_secret()
                                }
                            };

                            if uri_changed || tables_changed || credentials_changed {
                                if uri_changed {
                                    warn!("ScyllaDB URI changed from {} to {}, will reconnect...",
                                          config.scylladb_uri, new_config.scylladb_uri);
                                }
                                if tables_changed {
                                    warn!("Source table changed to {}.{}, will reconnect...",
                                          new_config.keyspace, new_config.source_table);
                                }
                                if credentials_changed {
                                    warn!("ScyllaDB credentials changed, will reconnect...");
                                }
                                config = new_config;

                                // the reconnection timer builds a new session
                                statements = None;
                                info!("Session canceled, reconnection will occur on next timer tick");
                            }
                        }
                    }

                    msg = rx.recv() => {
                        match msg {
                            None => break,
                            Some(msg) => {
                                if let Some(ref stmts) = statements {
                                    tokio::spawn(
                                        process(stmts.clone(), msg).instrument(error_span!("db-process")),
                                    );
                                } else {
                                    warn!("Received message but no valid session");
                                    respond_with_error(msg, anyhow::anyhow!("No active database session"));
                                }
                            }
                        }
                    }
                }
            }
        }
        .instrument(error_span!("db")),
    );
    Ok(tx)
}

fn respond_with_error(msg: Db, error: anyhow::Error) {
    match msg {
        Db::SourceCount { tx } => {
            let _ = tx.send(Err(error));
        }
        Db::ScanSource { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::GetArtist { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::CreateDerivedTable { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::TruncateDerivedTable { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::PutDerivedMeta { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::GetDerivedMeta { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::InsertDerivedRow { tx, .. } => {
            let _ = tx.send(Err(error));
        }
        Db::QueryDerived { tx, .. } => {
            let _ = tx.send(Err(error));
        }
    }
}

async fn process(statements: Arc<Statements>, msg: Db) {
    match msg {
        Db::SourceCount { tx } => tx
            .send(statements.source_count().await)
            .unwrap_or_else(|_| trace!("process: Db::SourceCount: unable to send response")),

        Db::ScanSource {
            page_size,
            page_state,
            tx,
        } => tx
            .send(statements.scan_source(page_size, page_state).await)
            .unwrap_or_else(|_| trace!("process: Db::ScanSource: unable to send response")),

        Db::GetArtist { id, tx } => tx
            .send(statements.get_artist(id).await)
            .unwrap_or_else(|_| trace!("process: Db::GetArtist: unable to send response")),

        Db::CreateDerivedTable { shape, tx } => tx
            .send(statements.create_derived_table(&shape).await)
            .unwrap_or_else(|_| trace!("process: Db::CreateDerivedTable: unable to send response")),

        Db::TruncateDerivedTable { table, tx } => tx
            .send(statements.truncate_derived_table(&table).await)
            .unwrap_or_else(|_| {
                trace!("process: Db::TruncateDerivedTable: unable to send response")
            }),

        Db::PutDerivedMeta { meta, tx } => tx
            .send(statements.put_derived_meta(meta).await)
            .unwrap_or_else(|_| trace!("process: Db::PutDerivedMeta: unable to send response")),

        Db::GetDerivedMeta { table, tx } => tx
            .send(statements.get_derived_meta(table).await)
            .unwrap_or_else(|_| trace!("process: Db::GetDerivedMeta: unable to send response")),

        Db::InsertDerivedRow { shape, row, tx } => tx
            .send(statements.insert_derived_row(&shape, &row).await)
            .unwrap_or_else(|_| trace!("process: Db::InsertDerivedRow: unable to send response")),

        Db::QueryDerived {
            shape,
            bucket,
            limit,
            tx,
        } => tx
            .send(statements.query_derived(&shape, bucket, limit).await)
            .unwrap_or_else(|_| trace!("process: Db::QueryDerived: unable to send response")),
    }
}

async fn create_session(config: &Config) -> anyhow::Result<Session> {
    let mut builder = SessionBuilder::new()
        .known_node(&config.scylladb_uri)
        .pipe(|builder| {
            if let Some(interval) = config.cql_keepalive_interval {
                info!("Setting CQL keepalive interval to {interval:?}");
                builder.keepalive_interval(interval)
            } else {
                builder
            }
        })
        .pipe(|builder| {
            if let Some(timeout) = config.cql_keepalive_timeout {
                info!("Setting CQL keepalive timeout to {timeout:?}");
                builder.keepalive_timeout(timeout)
            } else {
                builder
            }
        });

    if let Some(Credentials { username, password }) = &config.credentials {
        builder = builder.user(username, password.expose_secret());
        debug!("Username/password authentication configured");
    }

    Ok(builder.build().await?)
}

async fn connect(config: &Config) -> anyhow::Result<Statements> {
    let session = Arc::new(create_session(config).await?);
    Statements::new(
        session,
        config.keyspace.clone(),
        config.source_table.clone(),
    )
    .await
}

/// Columns read from the source table, in `SOURCE_COLUMNS` order.
type SourceRowT = (
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<i32>,
    Option<Vec<(Option<String>, Option<i32>, Option<i32>)>>,
    Option<Vec<f32>>,
);

const SOURCE_COLUMNS: &str = "id, name, sortable_name, followers, popularity, images, embedding";

fn source_row(
    (id, name, sortable_name, followers, popularity, images, embedding): SourceRowT,
) -> SourceRow {
    SourceRow {
        id: id.into(),
        name,
        sortable_name,
        followers,
        popularity,
        images: images
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(url, width, height)| {
                url.map(|url| Image { url, width, height })
            })
            .collect(),
        embedding: embedding.map(|embedding| embedding.into()),
    }
}

struct DerivedStatements {
    insert: PreparedStatement,
    select: PreparedStatement,
}

struct Statements {
    session: Arc<Session>,
    keyspace: KeyspaceName,
    st_source_count: PreparedStatement,
    st_scan_source: PreparedStatement,
    st_get_artist: PreparedStatement,
    st_put_derived_meta: PreparedStatement,
    st_get_derived_meta: PreparedStatement,
    derived: RwLock<HashMap<TableName, Arc<DerivedStatements>>>,
}

impl Statements {
    async fn new(
        session: Arc<Session>,
        keyspace: KeyspaceName,
        source_table: TableName,
    ) -> anyhow::Result<Self> {
        session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {keyspace}.derived_meta (
                        table_name text PRIMARY KEY,
                        bucket_count int,
                        updated_at timestamp
                    )"
                ),
                &[],
            )
            .await
            .context("create derived_meta")?;

        Ok(Self {
            st_source_count: session
                .prepare(format!("SELECT COUNT(*) FROM {keyspace}.{source_table}"))
                .await
                .context("ST_SOURCE_COUNT")?,

            st_scan_source: session
                .prepare(format!(
                    "SELECT {SOURCE_COLUMNS} FROM {keyspace}.{source_table}"
                ))
                .await
                .context("ST_SCAN_SOURCE")?,

            st_get_artist: session
                .prepare(format!(
                    "SELECT {SOURCE_COLUMNS} FROM {keyspace}.{source_table} WHERE id = ?"
                ))
                .await
                .context("ST_GET_ARTIST")?,

            st_put_derived_meta: session
                .prepare(format!(
                    "INSERT INTO {keyspace}.derived_meta (table_name, bucket_count, updated_at) VALUES (?, ?, ?)"
                ))
                .await
                .context("ST_PUT_DERIVED_META")?,

            st_get_derived_meta: session
                .prepare(format!(
                    "SELECT bucket_count, updated_at FROM {keyspace}.derived_meta WHERE table_name = ?"
                ))
                .await
                .context("ST_GET_DERIVED_META")?,

            derived: RwLock::new(HashMap::new()),
            keyspace,
            session,
        })
    }

    async fn source_count(&self) -> SourceCountR {
        let (count,) = self
            .session
            .execute_unpaged(&self.st_source_count, &[])
            .await?
            .into_rows_result()?
            .single_row::<(i64,)>()?;
        Ok(count.try_into().unwrap_or_default())
    }

    async fn scan_source(
        &self,
        page_size: NonZeroUsize,
        page_state: Option<PageState>,
    ) -> ScanSourceR {
        let mut statement = self.st_scan_source.clone();
        statement.set_page_size(page_size.get().try_into().unwrap_or(i32::MAX));
        let paging_state = page_state
            .map(|state| PagingState::new_from_raw_bytes(state.as_bytes()))
            .unwrap_or_else(PagingState::start);

        let (result, paging_state_response) = self
            .session
            .execute_single_page(&statement, &[], paging_state)
            .await?;
        let rows = result
            .into_rows_result()?
            .rows::<SourceRowT>()?
            .map_ok(source_row)
            .collect::<Result<Vec<_>, _>>()?;

        let next = match paging_state_response {
            PagingStateResponse::HasMorePages { state } => state
                .as_bytes_slice()
                .map(|bytes| PageState::from(Arc::clone(bytes))),
            PagingStateResponse::NoMorePages => None,
        };
        Ok(SourcePage { rows, next })
    }

    async fn get_artist(&self, id: ArtistId) -> GetArtistR {
        Ok(self
            .session
            .execute_unpaged(&self.st_get_artist, (id,))
            .await?
            .into_rows_result()?
            .maybe_first_row::<SourceRowT>()?
            .map(source_row))
    }

    async fn create_derived_table(&self, shape: &TableShape) -> CreateDerivedTableR {
        self.session
            .query_unpaged(shape.create_table_cql(&self.keyspace), &[])
            .await
            .with_context(|| format!("create {}", shape.table))?;
        // a table recreated with the same name needs statements prepared again
        self.derived.write().await.remove(&shape.table);
        Ok(())
    }

    async fn truncate_derived_table(&self, table: &TableName) -> TruncateDerivedTableR {
        self.session
            .query_unpaged(format!("TRUNCATE {}.{table}", self.keyspace), &[])
            .await
            .with_context(|| format!("truncate {table}"))?;
        Ok(())
    }

    async fn put_derived_meta(&self, meta: DerivedTableMeta) -> PutDerivedMetaR {
        let bucket_count: i32 = meta.bucket_count.get().try_into()?;
        self.session
            .execute_unpaged(
                &self.st_put_derived_meta,
                (meta.table, bucket_count, meta.updated_at),
            )
            .await?;
        Ok(())
    }

    async fn get_derived_meta(&self, table: TableName) -> GetDerivedMetaR {
        self.session
            .execute_unpaged(&self.st_get_derived_meta, (table.clone(),))
            .await?
            .into_rows_result()?
            .maybe_first_row::<(i32, OffsetDateTime)>()?
            .map(|(bucket_count, updated_at)| -> anyhow::Result<_> {
                Ok(DerivedTableMeta {
                    bucket_count: u32::try_from(bucket_count)
                        .with_context(|| format!("bucket count of {table}"))?
                        .into(),
                    table: table.clone(),
                    updated_at,
                })
            })
            .transpose()
    }

    async fn derived_statements(&self, shape: &TableShape) -> anyhow::Result<Arc<DerivedStatements>> {
        if let Some(statements) = self.derived.read().await.get(&shape.table) {
            return Ok(Arc::clone(statements));
        }
        let statements = Arc::new(DerivedStatements {
            insert: self
                .session
                .prepare(shape.insert_cql(&self.keyspace))
                .await
                .with_context(|| format!("prepare insert into {}", shape.table))?,
            select: self
                .session
                .prepare(shape.select_cql(&self.keyspace))
                .await
                .with_context(|| format!("prepare select from {}", shape.table))?,
        });
        self.derived
            .write()
            .await
            .insert(shape.table.clone(), Arc::clone(&statements));
        Ok(statements)
    }

    async fn insert_derived_row(&self, shape: &TableShape, row: &DerivedRow) -> InsertDerivedRowR {
        let statements = self.derived_statements(shape).await?;
        self.session
            .execute_unpaged(&statements.insert, shape.insert_values(row)?)
            .await?;
        Ok(())
    }

    async fn query_derived(
        &self,
        shape: &TableShape,
        bucket: Option<i32>,
        limit: usize,
    ) -> QueryDerivedR {
        let statements = self.derived_statements(shape).await?;
        let limit: i32 = limit.try_into()?;
        let result = match (shape.is_numeric(), bucket) {
            (true, Some(bucket)) => {
                self.session
                    .execute_unpaged(&statements.select, (bucket, limit))
                    .await?
            }
            (false, None) => {
                self.session
                    .execute_unpaged(&statements.select, (limit,))
                    .await?
            }
            (_, bucket) => anyhow::bail!("bucket {bucket:?} does not fit a table {}", shape.table),
        };
        result
            .into_rows_result()?
            .rows::<Row>()?
            .map(|row| shape.parse_row(row?, bucket))
            .collect()
    }
}
