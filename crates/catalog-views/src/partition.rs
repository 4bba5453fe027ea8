/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

//! Physical layouts of derived tables.
//!
//! Numeric sort columns are heavily skewed, so their rows are spread over `bucket_count`
//! synthetic partitions chosen by hashing a stable secondary key, and the sort column becomes a
//! clustering column inside every bucket. Text sort columns partition directly.

use crate::ArtistId;
use crate::BucketCount;
use crate::Image;
use crate::KeyspaceName;
use crate::SourceRow;
use crate::TableName;
use crate::sort_spec::SortKey;
use crate::sort_spec::SortSpec;
use anyhow::bail;
use itertools::Itertools;
use scylla::value::CqlValue;
use scylla::value::Row;
use sha2::Digest;
use sha2::Sha256;
use std::cmp::Ordering;
use time::OffsetDateTime;

const IMAGES_TYPE: &str = "list<frozen<tuple<text, int, int>>>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// partition: bucket, clustering: (sort column, sortable_name, id)
    Numeric { bucket_count: BucketCount },
    /// partition: the sort column which is the sortable name itself, clustering: id
    TextSelf,
    /// partition: the sort column, clustering: (sortable_name, id)
    TextOther,
}

#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Deserialize,
    serde::Serialize,
    utoipa::ToSchema,
)]
#[serde(untagged)]
/// Value of the sort column stored in a derived row.
pub enum SortValue {
    Integer(i64),
    Text(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DerivedRow {
    /// Present only in the numeric layout.
    pub bucket: Option<i32>,
    pub value: SortValue,
    pub sortable_name: String,
    pub id: ArtistId,
    pub name: Option<String>,
    pub images: Vec<Image>,
}

#[derive(Clone, Debug, PartialEq)]
/// Persisted alongside every derived table.
pub struct DerivedTableMeta {
    pub table: TableName,
    pub bucket_count: BucketCount,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableShape {
    pub spec: &'static SortSpec,
    pub table: TableName,
    pub layout: Layout,
}

pub fn table_name(key: SortKey) -> TableName {
    format!("derived_by_{key}").into()
}

/// Maps a sort key to its physical layout. `bucket_count` is used by numeric keys only.
pub fn plan(key: SortKey, bucket_count: BucketCount) -> TableShape {
    let layout = match key {
        SortKey::Followers | SortKey::Popularity => Layout::Numeric { bucket_count },
        SortKey::Name => Layout::TextSelf,
        SortKey::DisplayName => Layout::TextOther,
    };
    TableShape {
        spec: key.spec(),
        table: table_name(key),
        layout,
    }
}

/// Deterministic bucket of a stable key: the first 8 bytes of its SHA-256 as a big endian
/// integer modulo `bucket_count`.
pub fn bucket_for(stable_key: &str, bucket_count: BucketCount) -> i32 {
    let digest = Sha256::digest(stable_key.as_bytes());
    let mut prefix = [0; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(prefix) % u64::from(bucket_count.get().max(1));
    bucket as i32
}

fn stable_key(row: &SourceRow) -> String {
    row.name
        .as_ref()
        .map(|name| name.to_lowercase())
        .unwrap_or_else(|| row.id.to_string())
}

fn sortable_name(row: &SourceRow) -> String {
    row.sortable_name
        .clone()
        .or_else(|| row.name.as_ref().map(|name| name.to_lowercase()))
        .unwrap_or_else(|| row.id.to_string())
}

impl TableShape {
    pub fn key(&self) -> SortKey {
        self.spec.key
    }

    pub fn bucket_count(&self) -> BucketCount {
        match self.layout {
            Layout::Numeric { bucket_count } => bucket_count,
            Layout::TextSelf | Layout::TextOther => 1.into(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.layout, Layout::Numeric { .. })
    }

    /// Columns of a derived row in statement order, the bucket excluded.
    pub fn value_columns(&self) -> Vec<&'static str> {
        match self.layout {
            Layout::Numeric { .. } => {
                vec![self.spec.column, "sortable_name", "id", "name", "images"]
            }
            Layout::TextSelf => vec!["sortable_name", "id", "name", "images"],
            Layout::TextOther => vec!["name", "sortable_name", "id", "images"],
        }
    }

    fn insert_columns(&self) -> Vec<&'static str> {
        let mut columns = self.value_columns();
        if self.is_numeric() {
            columns.insert(0, "bucket");
        }
        columns
    }

    pub fn create_table_cql(&self, keyspace: &KeyspaceName) -> String {
        let column = self.spec.column;
        let (columns, primary_key, clustering) = match self.layout {
            Layout::Numeric { .. } => (
                format!(
                    "bucket int, {column} bigint, sortable_name text, id text, name text, images {IMAGES_TYPE}"
                ),
                format!("(bucket), {column}, sortable_name, id"),
                format!("{column} {}, sortable_name ASC, id ASC", self.spec.order.cql()),
            ),
            Layout::TextSelf => (
                format!("sortable_name text, id text, name text, images {IMAGES_TYPE}"),
                "(sortable_name), id".to_string(),
                "id ASC".to_string(),
            ),
            Layout::TextOther => (
                format!("{column} text, sortable_name text, id text, images {IMAGES_TYPE}"),
                format!("({column}), sortable_name, id"),
                "sortable_name ASC, id ASC".to_string(),
            ),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {keyspace}.{table} ({columns}, PRIMARY KEY ({primary_key})) \
            WITH CLUSTERING ORDER BY ({clustering})",
            table = self.table
        )
    }

    pub fn insert_cql(&self, keyspace: &KeyspaceName) -> String {
        let columns = self.insert_columns();
        format!(
            "INSERT INTO {keyspace}.{table} ({}) VALUES ({})",
            columns.iter().join(", "),
            columns.iter().map(|_| "?").join(", "),
            table = self.table
        )
    }

    /// Numeric layouts read a single bucket, `bucket` and `limit` are bound in that order.
    /// Text layouts bind `limit` only.
    pub fn select_cql(&self, keyspace: &KeyspaceName) -> String {
        let columns = self.value_columns().iter().join(", ");
        let restriction = if self.is_numeric() {
            " WHERE bucket = ?"
        } else {
            ""
        };
        format!(
            "SELECT {columns} FROM {keyspace}.{table}{restriction} LIMIT ?",
            table = self.table
        )
    }

    /// Builds the physical row of a source row, None if the row has no value to sort by.
    pub fn derive(&self, row: &SourceRow) -> Option<DerivedRow> {
        let sortable_name = sortable_name(row);
        let value = match self.spec.key {
            SortKey::Followers => SortValue::Integer(row.followers?),
            SortKey::Popularity => SortValue::Integer(row.popularity?.into()),
            SortKey::Name => SortValue::Text(sortable_name.clone()),
            SortKey::DisplayName => {
                SortValue::Text(row.name.clone().unwrap_or_else(|| row.id.to_string()))
            }
        };
        let bucket = match self.layout {
            Layout::Numeric { bucket_count } => Some(bucket_for(&stable_key(row), bucket_count)),
            Layout::TextSelf | Layout::TextOther => None,
        };
        Some(DerivedRow {
            bucket,
            value,
            sortable_name,
            id: row.id.clone(),
            name: row.name.clone(),
            images: row.images.clone(),
        })
    }

    /// Values bound to the insert statement.
    pub fn insert_values(&self, row: &DerivedRow) -> anyhow::Result<Vec<Option<CqlValue>>> {
        let value = match (&self.layout, &row.value) {
            (Layout::Numeric { .. }, SortValue::Integer(value)) => CqlValue::BigInt(*value),
            (Layout::TextSelf | Layout::TextOther, SortValue::Text(value)) => {
                CqlValue::Text(value.clone())
            }
            (layout, value) => bail!("value {value:?} does not fit a {layout:?} layout"),
        };
        let sortable_name = Some(CqlValue::Text(row.sortable_name.clone()));
        let id = Some(CqlValue::Text(row.id.to_string()));
        let name = row.name.clone().map(CqlValue::Text);
        let images = Some(images_to_cql(&row.images));
        Ok(match self.layout {
            Layout::Numeric { .. } => {
                let Some(bucket) = row.bucket else {
                    bail!("missing bucket of a row {}", row.id);
                };
                vec![
                    Some(CqlValue::Int(bucket)),
                    Some(value),
                    sortable_name,
                    id,
                    name,
                    images,
                ]
            }
            Layout::TextSelf => vec![Some(value), id, name, images],
            Layout::TextOther => vec![Some(value), sortable_name, id, images],
        })
    }

    /// Parses a row selected with `select_cql`.
    pub fn parse_row(&self, row: Row, bucket: Option<i32>) -> anyhow::Result<DerivedRow> {
        let mut columns = row.columns.into_iter();
        let mut next = || columns.next().flatten();
        Ok(match self.layout {
            Layout::Numeric { .. } => {
                let Some(CqlValue::BigInt(value)) = next() else {
                    bail!("{}: expected bigint value", self.table);
                };
                let sortable_name = text(next(), "sortable_name")?;
                let id = text(next(), "id")?;
                let name = optional_text(next(), "name")?;
                DerivedRow {
                    bucket,
                    value: SortValue::Integer(value),
                    sortable_name,
                    id: id.into(),
                    name,
                    images: images_from_cql(next())?,
                }
            }
            Layout::TextSelf => {
                let sortable_name = text(next(), "sortable_name")?;
                let id = text(next(), "id")?;
                let name = optional_text(next(), "name")?;
                DerivedRow {
                    bucket: None,
                    value: SortValue::Text(sortable_name.clone()),
                    sortable_name,
                    id: id.into(),
                    name,
                    images: images_from_cql(next())?,
                }
            }
            Layout::TextOther => {
                let name = text(next(), "name")?;
                let sortable_name = text(next(), "sortable_name")?;
                let id = text(next(), "id")?;
                // an artist without a name is partitioned by its id
                let display_name = (name != id).then(|| name.clone());
                DerivedRow {
                    bucket: None,
                    value: SortValue::Text(name),
                    sortable_name,
                    id: id.into(),
                    name: display_name,
                    images: images_from_cql(next())?,
                }
            }
        })
    }

    /// Rank of two rows of this table: the sort value in the declared order, ties broken by
    /// sortable name and then id, both ascending. Matches the clustering order of a partition.
    pub fn rank_cmp(&self, a: &DerivedRow, b: &DerivedRow) -> Ordering {
        self.spec
            .order
            .apply(a.value.cmp(&b.value))
            .then_with(|| a.sortable_name.cmp(&b.sortable_name))
            .then_with(|| a.id.cmp(&b.id))
    }
}

fn text(value: Option<CqlValue>, column: &str) -> anyhow::Result<String> {
    match value {
        Some(CqlValue::Text(value)) | Some(CqlValue::Ascii(value)) => Ok(value),
        other => bail!("expected text in a column {column}, got {other:?}"),
    }
}

fn optional_text(value: Option<CqlValue>, column: &str) -> anyhow::Result<Option<String>> {
    value.map(|value| text(Some(value), column)).transpose()
}

fn images_to_cql(images: &[Image]) -> CqlValue {
    CqlValue::List(
        images
            .iter()
            .map(|image| {
                CqlValue::Tuple(vec![
                    Some(CqlValue::Text(image.url.clone())),
                    image.width.map(CqlValue::Int),
                    image.height.map(CqlValue::Int),
                ])
            })
            .collect(),
    )
}

fn images_from_cql(value: Option<CqlValue>) -> anyhow::Result<Vec<Image>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let CqlValue::List(images) = value else {
        bail!("expected a list of images, got {value:?}");
    };
    images
        .into_iter()
        .map(|image| {
            let CqlValue::Tuple(fields) = image else {
                bail!("expected an image tuple, got {image:?}");
            };
            let mut fields = fields.into_iter();
            let url = text(fields.next().flatten(), "images.url")?;
            let mut int = || match fields.next().flatten() {
                Some(CqlValue::Int(value)) => Ok(Some(value)),
                None => Ok(None),
                Some(other) => bail!("expected an image dimension, got {other:?}"),
            };
            Ok(Image {
                url,
                width: int()?,
                height: int()?,
            })
        })
        .collect()
}
