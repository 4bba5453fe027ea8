/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

//! Nearest neighbors of an artist by cosine similarity of embeddings, computed by a full scan of
//! the source table.

use crate::ArtistId;
use crate::SourceRow;
use crate::cursor::SourceCursor;
use crate::db::Db;
use crate::db::DbExt;
use crate::error::ViewError;
use crate::error::ViewResult;
use anyhow::Context;
use std::num::NonZeroUsize;
use time::OffsetDateTime;
use tokio::sync::mpsc::Sender;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
/// Summary of the artist the neighbors were scored against.
pub struct Subject {
    pub id: ArtistId,
    pub name: Option<String>,
    pub image_url: Option<String>,
}

impl From<&SourceRow> for Subject {
    fn from(row: &SourceRow) -> Self {
        Self {
            id: row.id.clone(),
            name: row.name.clone(),
            image_url: row.image_url(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct Neighbor {
    pub id: ArtistId,
    pub name: Option<String>,
    pub image_url: Option<String>,
    /// Cosine similarity in \[-1.0, 1.0\].
    pub score: f64,
    /// The score clamped to \[0.0, 1.0\] as a rounded percentage.
    pub score_percent: u8,
}

impl Neighbor {
    fn new(row: &SourceRow, score: f64) -> Self {
        Self {
            id: row.id.clone(),
            name: row.name.clone(),
            image_url: row.image_url(),
            score,
            score_percent: score_percent(score),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
/// Ranked neighbors of a subject, best first.
pub struct Scored {
    pub subject: Subject,
    pub items: Vec<Neighbor>,
    pub scored_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Similar {
    pub scored: Scored,
    pub limit: usize,
    pub from_cache: bool,
}

/// Cosine similarity over the common prefix of both vectors. A zero norm on either side scores
/// 0.0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let (dot, norm_a, norm_b) =
        a.iter()
            .zip(b)
            .fold((0.0, 0.0, 0.0), |(dot, norm_a, norm_b), (&a, &b)| {
                let (a, b) = (f64::from(a), f64::from(b));
                (dot + a * b, norm_a + a * a, norm_b + b * b)
            });
    let mut denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 {
        denominator = 1.0;
    }
    (dot / denominator).clamp(-1.0, 1.0)
}

pub fn score_percent(score: f64) -> u8 {
    (score.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// Scores every other artist with an embedding against `id` and returns the best `k`.
pub(crate) async fn score(
    db: &Sender<Db>,
    id: &ArtistId,
    k: usize,
    page_size: NonZeroUsize,
) -> ViewResult<Scored> {
    let subject = db
        .get_artist(id.clone())
        .await
        .context("read subject artist")?
        .ok_or_else(|| ViewError::NotFound(format!("artist {id} not found")))?;
    let embedding = subject
        .embedding
        .as_ref()
        .filter(|embedding| !embedding.is_empty())
        .ok_or_else(|| ViewError::InvalidState(format!("artist {id} has no embedding")))?;

    let mut candidates = Vec::new();
    let mut cursor = SourceCursor::new(db.clone(), page_size);
    while let Some(rows) = cursor.next_page().await.context("scan source table")? {
        candidates.extend(
            rows.iter()
                .filter(|row| &row.id != id)
                .filter_map(|row| {
                    let other = row.embedding.as_ref().filter(|other| !other.is_empty())?;
                    Some(Neighbor::new(
                        row,
                        cosine(embedding.as_slice(), other.as_slice()),
                    ))
                }),
        );
        crate::move_to_the_end_of_async_runtime_queue().await;
    }
    debug!("scored {} candidates against {id}", candidates.len());

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    candidates.truncate(k);
    Ok(Scored {
        subject: Subject::from(&subject),
        items: candidates,
        scored_at: OffsetDateTime::now_utc(),
    })
}
