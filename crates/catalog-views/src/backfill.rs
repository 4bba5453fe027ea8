/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::JobId;
use crate::cursor::SourceCursor;
use crate::db::Db;
use crate::db::DbExt;
use crate::jobs::JobOutcome;
use crate::jobs::Jobs;
use crate::jobs::JobsExt;
use crate::partition::DerivedTableMeta;
use crate::partition::TableShape;
use anyhow::Context;
use std::num::NonZeroUsize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::info;
use tracing::info_span;
use tracing::warn;

pub(crate) struct Backfill {
    pub(crate) job: JobId,
    pub(crate) shape: Arc<TableShape>,
    pub(crate) truncate_first: bool,
    pub(crate) page_size: NonZeroUsize,
    pub(crate) flush_rows: NonZeroUsize,
}

enum ScanEnd {
    Exhausted,
    Canceled,
}

/// Runs the backfill detached, the job record is the only channel of its result.
pub(crate) fn spawn(
    db: Sender<Db>,
    jobs: Sender<Jobs>,
    backfill: Backfill,
    token: CancellationToken,
) -> JoinHandle<()> {
    let span = info_span!("backfill", job = %backfill.job, table = %backfill.shape.table);
    tokio::spawn(
        async move {
            let mut inserted = 0;
            let outcome = match run(&db, &jobs, &backfill, &token, &mut inserted).await {
                Ok(ScanEnd::Exhausted) => JobOutcome::Done { inserted },
                Ok(ScanEnd::Canceled) => {
                    info!("canceled after {inserted} rows");
                    JobOutcome::Canceled { inserted }
                }
                Err(err) => {
                    warn!("failed after {inserted} rows: {err:#}");
                    JobOutcome::Error {
                        inserted,
                        message: format!("{err:#}"),
                    }
                }
            };
            jobs.finish(backfill.job, outcome).await;
        }
        .instrument(span),
    )
}

async fn run(
    db: &Sender<Db>,
    jobs: &Sender<Jobs>,
    backfill: &Backfill,
    token: &CancellationToken,
    inserted: &mut u64,
) -> anyhow::Result<ScanEnd> {
    let shape = &backfill.shape;

    // the job is building from here, whatever the storage does
    jobs.progress(backfill.job, 0, None).await;

    db.create_derived_table(Arc::clone(shape))
        .await
        .context("create derived table")?;
    if backfill.truncate_first {
        db.truncate_derived_table(shape.table.clone())
            .await
            .context("truncate derived table")?;
    }
    db.put_derived_meta(DerivedTableMeta {
        table: shape.table.clone(),
        bucket_count: shape.bucket_count(),
        updated_at: OffsetDateTime::now_utc(),
    })
    .await
    .context("record derived table metadata")?;

    let total = db.source_count().await.unwrap_or_else(|err| {
        warn!("unable to count source rows: {err:#}");
        0
    });
    jobs.progress(backfill.job, 0, Some(total)).await;
    info!("backfilling about {total} rows");

    let flush_rows = backfill.flush_rows.get() as u64;
    let mut cursor = SourceCursor::new(db.clone(), backfill.page_size);
    loop {
        let page = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(ScanEnd::Canceled),
            page = cursor.next_page() => page.context("scan source table")?,
        };
        let Some(rows) = page else {
            break;
        };

        for row in rows {
            if token.is_cancelled() {
                return Ok(ScanEnd::Canceled);
            }
            let Some(derived) = shape.derive(&row) else {
                continue;
            };
            db.insert_derived_row(Arc::clone(shape), derived)
                .await
                .with_context(|| format!("insert a row {}", row.id))?;
            *inserted += 1;
            if *inserted % flush_rows == 0 {
                jobs.progress(backfill.job, *inserted, None).await;
            }
        }
    }

    Ok(ScanEnd::Exhausted)
}
