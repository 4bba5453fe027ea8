/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::ArtistId;
use crate::BucketCount;
use crate::Config;
use crate::JobId;
use crate::backfill;
use crate::backfill::Backfill;
use crate::db::Db;
use crate::error::ViewError;
use crate::error::ViewResult;
use crate::jobs;
use crate::jobs::Job;
use crate::jobs::Jobs;
use crate::jobs::JobsExt;
use crate::partition;
use crate::partition::DerivedRow;
use crate::similarity;
use crate::similarity::Similar;
use crate::similarity_cache;
use crate::similarity_cache::SimilarityCache;
use crate::similarity_cache::SimilarityCacheExt;
use crate::sort_spec::SortKey;
use crate::topk;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::Instrument;
use tracing::debug;
use tracing::debug_span;
use tracing::info;
use tracing::trace;

pub const DEFAULT_TOP_LIMIT: usize = 10;
pub const MAX_TOP_LIMIT: usize = 50;
pub const DEFAULT_SIMILAR_LIMIT: usize = 10;
pub const MAX_SIMILAR_LIMIT: usize = 25;

type StartBuildR = ViewResult<Job>;
type GetJobR = ViewResult<Job>;
type CancelJobR = ViewResult<Job>;
type GetTopR = ViewResult<Top>;
type SimilarR = ViewResult<Similar>;

#[derive(Clone, Debug, PartialEq)]
pub struct Top {
    pub sort_key: SortKey,
    pub limit: usize,
    pub rows: Vec<DerivedRow>,
}

pub(crate) enum Engine {
    StartBuild {
        sort_key: SortKey,
        bucket_count: Option<u32>,
        truncate_first: bool,
        tx: oneshot::Sender<StartBuildR>,
    },
    GetJob {
        id: JobId,
        tx: oneshot::Sender<GetJobR>,
    },
    CancelJob {
        id: JobId,
        tx: oneshot::Sender<CancelJobR>,
    },
    GetTop {
        sort_key: SortKey,
        limit: Option<usize>,
        tx: oneshot::Sender<GetTopR>,
    },
    Similar {
        id: ArtistId,
        limit: Option<usize>,
        tx: oneshot::Sender<SimilarR>,
    },
}

pub(crate) trait EngineExt {
    /// Accepts a build and returns its job right away, the backfill runs detached.
    async fn start_build(
        &self,
        sort_key: SortKey,
        bucket_count: Option<u32>,
        truncate_first: bool,
    ) -> StartBuildR;

    async fn get_job(&self, id: JobId) -> GetJobR;

    async fn cancel_job(&self, id: JobId) -> CancelJobR;

    async fn get_top(&self, sort_key: SortKey, limit: Option<usize>) -> GetTopR;

    async fn similar(&self, id: ArtistId, limit: Option<usize>) -> SimilarR;
}

impl EngineExt for mpsc::Sender<Engine> {
    async fn start_build(
        &self,
        sort_key: SortKey,
        bucket_count: Option<u32>,
        truncate_first: bool,
    ) -> StartBuildR {
        let (tx, rx) = oneshot::channel();
        self.send(Engine::StartBuild {
            sort_key,
            bucket_count,
            truncate_first,
            tx,
        })
        .await
        .expect("EngineExt::start_build: internal actor should receive request");
        rx.await
            .expect("EngineExt::start_build: internal actor should send response")
    }

    async fn get_job(&self, id: JobId) -> GetJobR {
        let (tx, rx) = oneshot::channel();
        self.send(Engine::GetJob { id, tx })
            .await
            .expect("EngineExt::get_job: internal actor should receive request");
        rx.await
            .expect("EngineExt::get_job: internal actor should send response")
    }

    async fn cancel_job(&self, id: JobId) -> CancelJobR {
        let (tx, rx) = oneshot::channel();
        self.send(Engine::CancelJob { id, tx })
            .await
            .expect("EngineExt::cancel_job: internal actor should receive request");
        rx.await
            .expect("EngineExt::cancel_job: internal actor should send response")
    }

    async fn get_top(&self, sort_key: SortKey, limit: Option<usize>) -> GetTopR {
        let (tx, rx) = oneshot::channel();
        self.send(Engine::GetTop {
            sort_key,
            limit,
            tx,
        })
        .await
        .expect("EngineExt::get_top: internal actor should receive request");
        rx.await
            .expect("EngineExt::get_top: internal actor should send response")
    }

    async fn similar(&self, id: ArtistId, limit: Option<usize>) -> SimilarR {
        let (tx, rx) = oneshot::channel();
        self.send(Engine::Similar { id, limit, tx })
            .await
            .expect("EngineExt::similar: internal actor should receive request");
        rx.await
            .expect("EngineExt::similar: internal actor should send response")
    }
}

pub(crate) fn new(
    db: mpsc::Sender<Db>,
    config_rx: watch::Receiver<Arc<Config>>,
) -> mpsc::Sender<Engine> {
    let (tx, mut rx) = mpsc::channel(10);

    let jobs_actor = jobs::new();
    let cache_actor = similarity_cache::new(config_rx.clone());

    tokio::spawn(
        async move {
            debug!("starting");

            while let Some(msg) = rx.recv().await {
                let config = config_rx.borrow().clone();
                match msg {
                    Engine::StartBuild {
                        sort_key,
                        bucket_count,
                        truncate_first,
                        tx,
                    } => {
                        start_build(
                            sort_key,
                            bucket_count,
                            truncate_first,
                            tx,
                            &db,
                            &jobs_actor,
                            &config,
                        )
                        .await
                    }

                    Engine::GetJob { id, tx } => get_job(id, tx, &jobs_actor).await,

                    Engine::CancelJob { id, tx } => cancel_job(id, tx, &jobs_actor).await,

                    Engine::GetTop {
                        sort_key,
                        limit,
                        tx,
                    } => {
                        tokio::spawn(
                            get_top(sort_key, limit, tx, db.clone())
                                .instrument(debug_span!("top", %sort_key)),
                        );
                    }

                    Engine::Similar { id, limit, tx } => {
                        let span = debug_span!("similar", %id);
                        tokio::spawn(
                            similar(id, limit, tx, db.clone(), cache_actor.clone(), config)
                                .instrument(span),
                        );
                    }
                }
            }

            debug!("finished");
        }
        .instrument(debug_span!("engine")),
    );

    tx
}

/// Bucket count of a new build, only numeric layouts check the requested value.
fn validate_bucket_count(
    sort_key: SortKey,
    requested: Option<u32>,
    config: &Config,
) -> ViewResult<BucketCount> {
    let Some(requested) = requested else {
        return Ok(config.default_bucket_count);
    };
    if partition::plan(sort_key, config.default_bucket_count).is_numeric()
        && !(1..=BucketCount::MAX).contains(&requested)
    {
        return Err(ViewError::Validation(format!(
            "bucket count must be between 1 and {}, got {requested}",
            BucketCount::MAX
        )));
    }
    Ok(requested.into())
}

fn validate_limit(requested: Option<usize>, default: usize, max: usize) -> ViewResult<usize> {
    let limit = requested.unwrap_or(default);
    if !(1..=max).contains(&limit) {
        return Err(ViewError::Validation(format!(
            "limit must be between 1 and {max}, got {limit}"
        )));
    }
    Ok(limit)
}

async fn start_build(
    sort_key: SortKey,
    bucket_count: Option<u32>,
    truncate_first: bool,
    tx: oneshot::Sender<StartBuildR>,
    db: &mpsc::Sender<Db>,
    jobs: &mpsc::Sender<Jobs>,
    config: &Config,
) {
    tx.send(try_start_build(sort_key, bucket_count, truncate_first, db, jobs, config).await)
        .unwrap_or_else(|_| trace!("start_build: unable to send response"));
}

async fn try_start_build(
    sort_key: SortKey,
    bucket_count: Option<u32>,
    truncate_first: bool,
    db: &mpsc::Sender<Db>,
    jobs: &mpsc::Sender<Jobs>,
    config: &Config,
) -> StartBuildR {
    let bucket_count = validate_bucket_count(sort_key, bucket_count, config)?;
    let shape = Arc::new(partition::plan(sort_key, bucket_count));
    let (job, token) = jobs.create(sort_key).await?;
    info!(
        "starting a build of {} as a job {} with {} buckets",
        shape.table,
        job.id,
        shape.bucket_count()
    );
    backfill::spawn(
        db.clone(),
        jobs.clone(),
        Backfill {
            job: job.id,
            shape,
            truncate_first,
            page_size: config.scan_page_size,
            flush_rows: config.progress_flush_rows,
        },
        token,
    );
    Ok(job)
}

async fn get_job(id: JobId, tx: oneshot::Sender<GetJobR>, jobs: &mpsc::Sender<Jobs>) {
    let result = jobs
        .get(id)
        .await
        .ok_or_else(|| ViewError::NotFound(format!("unknown job: {id}")));
    tx.send(result)
        .unwrap_or_else(|_| trace!("get_job: unable to send response"));
}

async fn cancel_job(id: JobId, tx: oneshot::Sender<CancelJobR>, jobs: &mpsc::Sender<Jobs>) {
    tx.send(jobs.cancel(id).await)
        .unwrap_or_else(|_| trace!("cancel_job: unable to send response"));
}

async fn get_top(
    sort_key: SortKey,
    limit: Option<usize>,
    tx: oneshot::Sender<GetTopR>,
    db: mpsc::Sender<Db>,
) {
    tx.send(try_get_top(sort_key, limit, &db).await)
        .unwrap_or_else(|_| trace!("get_top: unable to send response"));
}

async fn try_get_top(sort_key: SortKey, limit: Option<usize>, db: &mpsc::Sender<Db>) -> GetTopR {
    let limit = validate_limit(limit, DEFAULT_TOP_LIMIT, MAX_TOP_LIMIT)?;
    let rows = topk::top(db, sort_key, limit).await?;
    Ok(Top {
        sort_key,
        limit,
        rows,
    })
}

async fn similar(
    id: ArtistId,
    limit: Option<usize>,
    tx: oneshot::Sender<SimilarR>,
    db: mpsc::Sender<Db>,
    cache: mpsc::Sender<SimilarityCache>,
    config: Arc<Config>,
) {
    tx.send(try_similar(id, limit, &db, &cache, &config).await)
        .unwrap_or_else(|_| trace!("similar: unable to send response"));
}

async fn try_similar(
    id: ArtistId,
    limit: Option<usize>,
    db: &mpsc::Sender<Db>,
    cache: &mpsc::Sender<SimilarityCache>,
    config: &Config,
) -> SimilarR {
    let limit = validate_limit(limit, DEFAULT_SIMILAR_LIMIT, MAX_SIMILAR_LIMIT)?;
    if let Some(scored) = cache.get(id.clone(), limit).await {
        debug!("served from cache");
        return Ok(Similar {
            scored,
            limit,
            from_cache: true,
        });
    }
    let scored = similarity::score(db, &id, limit, config.scan_page_size).await?;
    cache.put(id, limit, scored.clone()).await;
    Ok(Similar {
        scored,
        limit,
        from_cache: false,
    })
}
