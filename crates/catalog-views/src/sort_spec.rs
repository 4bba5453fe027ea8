/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::error::ViewError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

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
#[serde(rename_all = "snake_case")]
/// A registered key a derived view can be sorted by.
pub enum SortKey {
    Followers,
    Popularity,
    Name,
    DisplayName,
}

impl SortKey {
    pub const ALL: [SortKey; 4] = [
        SortKey::Followers,
        SortKey::Popularity,
        SortKey::Name,
        SortKey::DisplayName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Followers => "followers",
            SortKey::Popularity => "popularity",
            SortKey::Name => "name",
            SortKey::DisplayName => "display_name",
        }
    }

    pub fn spec(&self) -> &'static SortSpec {
        match self {
            SortKey::Followers => &FOLLOWERS,
            SortKey::Popularity => &POPULARITY,
            SortKey::Name => &NAME,
            SortKey::DisplayName => &DISPLAY_NAME,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ViewError::Validation(format!("unknown sort key: {s}")))
    }
}

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
pub enum ValueType {
    Integer,
    Text,
}

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
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// Orders `ordering`, computed in ascending terms, by this direction.
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }

    pub fn cql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// Static descriptor of a sort key and the source column it reads.
pub struct SortSpec {
    pub key: SortKey,
    pub column: &'static str,
    pub value_type: ValueType,
    pub order: SortOrder,
}

static FOLLOWERS: SortSpec = SortSpec {
    key: SortKey::Followers,
    column: "followers",
    value_type: ValueType::Integer,
    order: SortOrder::Descending,
};

static POPULARITY: SortSpec = SortSpec {
    key: SortKey::Popularity,
    column: "popularity",
    value_type: ValueType::Integer,
    order: SortOrder::Descending,
};

static NAME: SortSpec = SortSpec {
    key: SortKey::Name,
    column: "sortable_name",
    value_type: ValueType::Text,
    order: SortOrder::Ascending,
};

static DISPLAY_NAME: SortSpec = SortSpec {
    key: SortKey::DisplayName,
    column: "name",
    value_type: ValueType::Text,
    order: SortOrder::Ascending,
};

pub fn registry() -> impl Iterator<Item = &'static SortSpec> {
    SortKey::ALL.into_iter().map(|key| key.spec())
}
