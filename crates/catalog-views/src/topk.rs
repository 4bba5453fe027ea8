/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::db::Db;
use crate::db::DbExt;
use crate::error::ViewError;
use crate::error::ViewResult;
use crate::partition;
use crate::partition::DerivedRow;
use crate::sort_spec::SortKey;
use anyhow::Context;
use futures::future;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::debug;

/// Reads the globally ranked first `limit` rows of the derived table of `key`.
///
/// Numeric layouts fan out over every stored bucket and merge the partial results, each bucket
/// contributes at most `limit` rows so the merge is exact. Text layouts are served by a single
/// bounded query.
pub(crate) async fn top(db: &Sender<Db>, key: SortKey, limit: usize) -> ViewResult<Vec<DerivedRow>> {
    let table = partition::table_name(key);
    let meta = db
        .get_derived_meta(table.clone())
        .await
        .context("read derived table metadata")?
        .ok_or_else(|| ViewError::NotFound(format!("derived table {table} is not built yet")))?;
    let shape = Arc::new(partition::plan(key, meta.bucket_count));

    let mut rows = if shape.is_numeric() {
        let buckets = 0..meta.bucket_count.get() as i32;
        debug!("reading {limit} rows from {} buckets of {table}", buckets.len());
        future::try_join_all(
            buckets.map(|bucket| db.query_derived(Arc::clone(&shape), Some(bucket), limit)),
        )
        .await
        .context("query derived table buckets")?
        .into_iter()
        .flatten()
        .collect()
    } else {
        db.query_derived(Arc::clone(&shape), None, limit)
            .await
            .context("query derived table")?
    };

    rows.sort_by(|a, b| shape.rank_cmp(a, b));
    rows.truncate(limit);
    Ok(rows)
}
