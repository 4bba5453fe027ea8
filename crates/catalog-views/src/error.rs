/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

/// Caller-visible failures of the control surface.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// The request was rejected before any I/O.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// The target exists but cannot serve the request.
    #[error("{0}")]
    InvalidState(String),

    /// Another operation holds the resource.
    #[error("{0}")]
    Conflict(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type ViewResult<T> = Result<T, ViewError>;
