/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use anyhow::anyhow;
use anyhow::bail;
use catalog_views::ArtistId;
use catalog_views::BucketCount;
use catalog_views::Embedding;
use catalog_views::Image;
use catalog_views::SourceRow;
use catalog_views::TableName;
use catalog_views::cursor::PageState;
use catalog_views::cursor::SourcePage;
use catalog_views::db::Db;
use catalog_views::partition;
use catalog_views::partition::DerivedRow;
use catalog_views::partition::DerivedTableMeta;
use catalog_views::partition::SortValue;
use catalog_views::partition::TableShape;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;

/// In-memory storage answering every message of the db actor.
#[derive(Clone)]
pub(crate) struct DbBasic(Arc<RwLock<DbMock>>);

pub(crate) fn new() -> (mpsc::Sender<Db>, DbBasic) {
    let (tx, mut rx) = mpsc::channel(10);
    let db = DbBasic::new();
    tokio::spawn({
        let db = db.clone();
        async move {
            while let Some(msg) = rx.recv().await {
                process_db(&db, msg);
            }
        }
    });
    (tx, db)
}

struct DbMock {
    source: BTreeMap<ArtistId, SourceRow>,
    derived: HashMap<TableName, Vec<DerivedRow>>,
    meta: HashMap<TableName, DerivedTableMeta>,
    insert_delay: Option<Duration>,
    fail_query_derived: bool,
    scans: usize,
}

impl DbBasic {
    pub(crate) fn new() -> Self {
        Self(Arc::new(RwLock::new(DbMock {
            source: BTreeMap::new(),
            derived: HashMap::new(),
            meta: HashMap::new(),
            insert_delay: None,
            fail_query_derived: false,
            scans: 0,
        })))
    }

    pub(crate) fn add_artists(&self, rows: impl IntoIterator<Item = SourceRow>) {
        let mut db = self.0.write().unwrap();
        rows.into_iter().for_each(|row| {
            db.source.insert(row.id.clone(), row);
        });
    }

    pub(crate) fn derived_rows(&self, table: &TableName) -> Vec<DerivedRow> {
        self.0
            .read()
            .unwrap()
            .derived
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_insert_delay(&self, delay: Duration) {
        self.0.write().unwrap().insert_delay = Some(delay);
    }

    pub(crate) fn set_fail_query_derived(&self, fail: bool) {
        self.0.write().unwrap().fail_query_derived = fail;
    }

    /// Number of source pages served so far.
    pub(crate) fn scans(&self) -> usize {
        self.0.read().unwrap().scans
    }
}

fn process_db(db: &DbBasic, msg: Db) {
    match msg {
        Db::SourceCount { tx } => {
            _ = tx.send(Ok(db.0.read().unwrap().source.len() as u64));
        }

        Db::ScanSource {
            page_size,
            page_state,
            tx,
        } => {
            _ = tx.send(scan_source(db, page_size, page_state));
        }

        Db::GetArtist { id, tx } => {
            _ = tx.send(Ok(db.0.read().unwrap().source.get(&id).cloned()));
        }

        Db::CreateDerivedTable { shape, tx } => {
            db.0.write()
                .unwrap()
                .derived
                .entry(shape.table.clone())
                .or_default();
            _ = tx.send(Ok(()));
        }

        Db::TruncateDerivedTable { table, tx } => {
            _ = tx.send(truncate(db, &table));
        }

        Db::PutDerivedMeta { meta, tx } => {
            db.0.write()
                .unwrap()
                .meta
                .insert(meta.table.clone(), meta);
            _ = tx.send(Ok(()));
        }

        Db::GetDerivedMeta { table, tx } => {
            _ = tx.send(Ok(db.0.read().unwrap().meta.get(&table).cloned()));
        }

        Db::InsertDerivedRow { shape, row, tx } => {
            let delay = db.0.read().unwrap().insert_delay;
            match delay {
                Some(delay) => {
                    let db = db.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        _ = tx.send(insert(&db, &shape, row));
                    });
                }
                None => {
                    _ = tx.send(insert(db, &shape, row));
                }
            }
        }

        Db::QueryDerived {
            shape,
            bucket,
            limit,
            tx,
        } => {
            _ = tx.send(query(db, &shape, bucket, limit));
        }
    }
}

fn scan_source(
    db: &DbBasic,
    page_size: NonZeroUsize,
    page_state: Option<PageState>,
) -> anyhow::Result<SourcePage> {
    let offset = match page_state {
        Some(state) => u64::from_be_bytes(
            state
                .as_bytes()
                .try_into()
                .map_err(|_| anyhow!("malformed page state"))?,
        ) as usize,
        None => 0,
    };

    let mut db = db.0.write().unwrap();
    db.scans += 1;
    let rows = db
        .source
        .values()
        .skip(offset)
        .take(page_size.get())
        .cloned()
        .collect_vec();
    let end = offset + rows.len();
    let next = (end < db.source.len()).then(|| PageState::from_bytes(&(end as u64).to_be_bytes()));
    Ok(SourcePage { rows, next })
}

fn truncate(db: &DbBasic, table: &TableName) -> anyhow::Result<()> {
    let mut db = db.0.write().unwrap();
    let Some(rows) = db.derived.get_mut(table) else {
        bail!("a table {table} does not exist");
    };
    rows.clear();
    Ok(())
}

fn insert(db: &DbBasic, shape: &TableShape, row: DerivedRow) -> anyhow::Result<()> {
    let mut db = db.0.write().unwrap();
    let Some(rows) = db.derived.get_mut(&shape.table) else {
        bail!("a table {} does not exist", shape.table);
    };
    // same primary key overwrites
    rows.retain(|stored| {
        !(stored.bucket == row.bucket
            && stored.value == row.value
            && stored.sortable_name == row.sortable_name
            && stored.id == row.id)
    });
    rows.push(row);
    Ok(())
}

fn query(
    db: &DbBasic,
    shape: &TableShape,
    bucket: Option<i32>,
    limit: usize,
) -> anyhow::Result<Vec<DerivedRow>> {
    let db = db.0.read().unwrap();
    if db.fail_query_derived {
        bail!("simulated read timeout on {}", shape.table);
    }
    let Some(rows) = db.derived.get(&shape.table) else {
        bail!("a table {} does not exist", shape.table);
    };
    let rows = rows
        .iter()
        .filter(|row| bucket.is_none() || row.bucket == bucket);
    let rows = if shape.is_numeric() {
        // clustering order inside a single bucket
        rows.sorted_by(|a, b| shape.rank_cmp(a, b)).collect_vec()
    } else {
        // an unrestricted scan walks partitions in hash order, unrelated to the sort column
        rows.sorted_by_key(|row| (partition_token(&row.value), row.id.clone()))
            .collect_vec()
    };
    Ok(rows.into_iter().take(limit).cloned().collect())
}

fn partition_token(value: &SortValue) -> i32 {
    let key = match value {
        SortValue::Integer(value) => value.to_string(),
        SortValue::Text(value) => value.clone(),
    };
    partition::bucket_for(&key, BucketCount::MAX.into())
}

/// An artist with a name derived from `idx`, its followers and an optional embedding.
pub(crate) fn artist(idx: usize, followers: Option<i64>, embedding: Option<Vec<f32>>) -> SourceRow {
    let mut row = SourceRow::new(format!("artist-{idx:02}"));
    row.name = Some(format!("Artist {idx:02}"));
    row.followers = followers;
    row.popularity = Some((idx % 100) as i32);
    row.images = vec![Image {
        url: format!("http://img/{idx}"),
        width: Some(320),
        height: Some(320),
    }];
    row.embedding = embedding.map(Embedding::from);
    row
}
