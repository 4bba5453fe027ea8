/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

//! In-memory registry of build jobs.
//!
//! A job moves `Starting -> Building -> {Done, Error, Canceled}`. A backfill reports progress
//! before its first storage call, so a job reaches a terminal state through `Building`.
//! Cancellation is two-phase:
//! `cancel` only flags the job and fires its token, the backfill task observing the token is the
//! one that moves the job to `Canceled`.
//!
//! Finished jobs are kept for [`FINISHED_JOB_RETENTION`] and pruned when a new job is created,
//! so the registry holds the running jobs plus the jobs finished within that window.

use crate::JobId;
use crate::error::ViewError;
use crate::sort_spec::SortKey;
use std::collections::HashMap;
use time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::debug_span;
use tracing::info;
use tracing::trace;

/// How long a finished job stays visible to `get`.
pub const FINISHED_JOB_RETENTION: Duration = Duration::hours(1);

type CreateR = Result<(Job, CancellationToken), ViewError>;
type GetR = Option<Job>;
type CancelR = Result<Job, ViewError>;

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde::Deserialize,
    serde::Serialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Lifecycle state of a build job.
pub enum JobStatus {
    /// The job is registered, the backfill has not reported progress yet.
    Starting,
    /// The backfill is walking the source table.
    Building,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Error | JobStatus::Canceled
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub sort_key: SortKey,
    pub status: JobStatus,
    pub inserted: u64,
    pub total: u64,
    pub canceled: bool,
    pub error: Option<String>,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl Job {
    fn new(sort_key: SortKey) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: JobId::new(),
            sort_key,
            status: JobStatus::Starting,
            inserted: 0,
            total: 0,
            canceled: false,
            error: None,
            started_at: now,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total > 0 {
            let percent = (self.inserted as f64 / self.total as f64 * 100.0).round();
            percent.min(100.0) as u8
        } else if self.status == JobStatus::Done {
            100
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// How a backfill run ended.
pub enum JobOutcome {
    Done { inserted: u64 },
    Canceled { inserted: u64 },
    Error { inserted: u64, message: String },
}

pub enum Jobs {
    Create {
        sort_key: SortKey,
        tx: oneshot::Sender<CreateR>,
    },
    Get {
        id: JobId,
        tx: oneshot::Sender<GetR>,
    },
    Cancel {
        id: JobId,
        tx: oneshot::Sender<CancelR>,
    },
    Progress {
        id: JobId,
        inserted: u64,
        total: Option<u64>,
    },
    Finish {
        id: JobId,
        outcome: JobOutcome,
    },
}

pub(crate) trait JobsExt {
    /// Registers a new job, rejected while another job for the same key is running.
    async fn create(&self, sort_key: SortKey) -> CreateR;

    async fn get(&self, id: JobId) -> GetR;

    /// Requests cancellation, a no-op for a finished job.
    async fn cancel(&self, id: JobId) -> CancelR;

    /// Reports progress, the first report moves a job to `Building`. The first report carrying a
    /// non-zero total fixes it.
    async fn progress(&self, id: JobId, inserted: u64, total: Option<u64>);

    async fn finish(&self, id: JobId, outcome: JobOutcome);
}

impl JobsExt for mpsc::Sender<Jobs> {
    async fn create(&self, sort_key: SortKey) -> CreateR {
        let (tx, rx) = oneshot::channel();
        self.send(Jobs::Create { sort_key, tx })
            .await
            .expect("JobsExt::create: internal actor should receive request");
        rx.await
            .expect("JobsExt::create: internal actor should send response")
    }

    async fn get(&self, id: JobId) -> GetR {
        let (tx, rx) = oneshot::channel();
        self.send(Jobs::Get { id, tx })
            .await
            .expect("JobsExt::get: internal actor should receive request");
        rx.await
            .expect("JobsExt::get: internal actor should send response")
    }

    async fn cancel(&self, id: JobId) -> CancelR {
        let (tx, rx) = oneshot::channel();
        self.send(Jobs::Cancel { id, tx })
            .await
            .expect("JobsExt::cancel: internal actor should receive request");
        rx.await
            .expect("JobsExt::cancel: internal actor should send response")
    }

    async fn progress(&self, id: JobId, inserted: u64, total: Option<u64>) {
        self.send(Jobs::Progress {
            id,
            inserted,
            total,
        })
        .await
        .expect("JobsExt::progress: internal actor should receive request");
    }

    async fn finish(&self, id: JobId, outcome: JobOutcome) {
        self.send(Jobs::Finish { id, outcome })
            .await
            .expect("JobsExt::finish: internal actor should receive request");
    }
}

type JobsT = HashMap<JobId, (Job, CancellationToken)>;

pub(crate) fn new() -> mpsc::Sender<Jobs> {
    let (tx, mut rx) = mpsc::channel(100);

    tokio::spawn(
        async move {
            debug!("starting");

            let mut jobs = JobsT::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    Jobs::Create { sort_key, tx } => create(sort_key, tx, &mut jobs),
                    Jobs::Get { id, tx } => get(id, tx, &jobs),
                    Jobs::Cancel { id, tx } => cancel(id, tx, &mut jobs),
                    Jobs::Progress {
                        id,
                        inserted,
                        total,
                    } => progress(id, inserted, total, &mut jobs),
                    Jobs::Finish { id, outcome } => finish(id, outcome, &mut jobs),
                }
            }

            debug!("finished");
        }
        .instrument(debug_span!("jobs")),
    );

    tx
}

fn create(sort_key: SortKey, tx: oneshot::Sender<CreateR>, jobs: &mut JobsT) {
    prune(jobs, OffsetDateTime::now_utc());
    let running = jobs
        .values()
        .find(|(job, _)| job.sort_key == sort_key && !job.status.is_terminal());
    let result = if let Some((job, _)) = running {
        Err(ViewError::Conflict(format!(
            "a build of {sort_key} is already running as a job {}",
            job.id
        )))
    } else {
        let job = Job::new(sort_key);
        let token = CancellationToken::new();
        info!("created a job {} for {sort_key}", job.id);
        jobs.insert(job.id, (job.clone(), token.clone()));
        Ok((job, token))
    };
    tx.send(result)
        .unwrap_or_else(|_| trace!("create: unable to send response"));
}

/// Removes jobs finished longer than the retention ago.
fn prune(jobs: &mut JobsT, now: OffsetDateTime) {
    jobs.retain(|id, (job, _)| {
        let expired = job
            .finished_at
            .is_some_and(|finished_at| now - finished_at > FINISHED_JOB_RETENTION);
        if expired {
            debug!("prune: dropping a finished job {id}");
        }
        !expired
    });
}

fn get(id: JobId, tx: oneshot::Sender<GetR>, jobs: &JobsT) {
    tx.send(jobs.get(&id).map(|(job, _)| job.clone()))
        .unwrap_or_else(|_| trace!("get: unable to send response"));
}

fn cancel(id: JobId, tx: oneshot::Sender<CancelR>, jobs: &mut JobsT) {
    let result = match jobs.get_mut(&id) {
        None => Err(ViewError::NotFound(format!("unknown job: {id}"))),
        Some((job, _)) if job.status.is_terminal() => Ok(job.clone()),
        Some((job, token)) => {
            if !job.canceled {
                info!("cancel requested for a job {id}");
                job.canceled = true;
                job.updated_at = OffsetDateTime::now_utc();
            }
            token.cancel();
            Ok(job.clone())
        }
    };
    tx.send(result)
        .unwrap_or_else(|_| trace!("cancel: unable to send response"));
}

fn progress(id: JobId, inserted: u64, total: Option<u64>, jobs: &mut JobsT) {
    let Some((job, _)) = jobs.get_mut(&id) else {
        debug!("progress: unknown job {id}");
        return;
    };
    if job.status.is_terminal() {
        debug!("progress: job {id} already finished");
        return;
    }
    if job.status == JobStatus::Starting {
        job.status = JobStatus::Building;
    }
    if let Some(total) = total
        && job.total == 0
    {
        job.total = total;
    }
    job.inserted = job.inserted.max(inserted);
    job.updated_at = OffsetDateTime::now_utc();
}

fn finish(id: JobId, outcome: JobOutcome, jobs: &mut JobsT) {
    let Some((job, _)) = jobs.get_mut(&id) else {
        debug!("finish: unknown job {id}");
        return;
    };
    if job.status.is_terminal() {
        debug!("finish: job {id} already finished");
        return;
    }
    let (status, inserted, error) = match outcome {
        JobOutcome::Done { inserted } => (JobStatus::Done, inserted, None),
        JobOutcome::Canceled { inserted } => (JobStatus::Canceled, inserted, None),
        JobOutcome::Error { inserted, message } => (JobStatus::Error, inserted, Some(message)),
    };
    let now = OffsetDateTime::now_utc();
    job.status = status;
    job.inserted = job.inserted.max(inserted);
    job.error = error;
    job.finished_at = Some(now);
    job.updated_at = now;
    info!(
        "job {id} finished as {status:?} with {} rows inserted",
        job.inserted
    );
}
