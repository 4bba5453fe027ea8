/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::SourceRow;
use crate::db::Db;
use crate::db::DbExt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

#[derive(Clone, Debug, PartialEq, Eq, derive_more::From)]
/// Opaque forward-only token of the storage layer used to resume a scan.
pub struct PageState(Arc<[u8]>);

impl PageState {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug)]
/// One bounded fetch of the source table.
pub struct SourcePage {
    pub rows: Vec<SourceRow>,
    /// None when the scan is exhausted.
    pub next: Option<PageState>,
}

/// Forward walk over the whole source table, one page per call. Rows mutated concurrently with
/// the walk may be missed or observed twice.
pub(crate) struct SourceCursor {
    db: Sender<Db>,
    page_size: NonZeroUsize,
    state: Option<PageState>,
    exhausted: bool,
}

impl SourceCursor {
    pub(crate) fn new(db: Sender<Db>, page_size: NonZeroUsize) -> Self {
        Self {
            db,
            page_size,
            state: None,
            exhausted: false,
        }
    }

    /// Returns the next page, None after the last one. A page may be empty while more pages
    /// follow.
    pub(crate) async fn next_page(&mut self) -> anyhow::Result<Option<Vec<SourceRow>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .db
            .scan_source(self.page_size, self.state.take())
            .await?;
        self.exhausted = page.next.is_none();
        self.state = page.next;
        Ok(Some(page.rows))
    }
}
