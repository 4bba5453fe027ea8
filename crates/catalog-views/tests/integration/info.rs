/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::db_basic;
use crate::enable_tracing;
use crate::run_service;
use catalog_views::Config;
use catalog_views::sort_spec::SortKey;
use catalog_views::sort_spec::SortOrder;
use catalog_views::sort_spec::ValueType;
use itertools::Itertools;

#[tokio::test]
async fn get_application_info() {
    enable_tracing();
    let (db_actor, _db) = db_basic::new();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let info = client.info().await;

    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(info.service, env!("CARGO_PKG_NAME"));
}

#[tokio::test]
async fn get_sort_keys() {
    enable_tracing();
    let (db_actor, _db) = db_basic::new();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let keys = client.sort_keys().await;

    assert_eq!(
        keys.iter().map(|info| info.key).collect_vec(),
        SortKey::ALL.to_vec()
    );
    let followers = &keys[0];
    assert_eq!(followers.column, "followers");
    assert_eq!(followers.value_type, ValueType::Integer);
    assert_eq!(followers.order, SortOrder::Descending);
    let name = keys.iter().find(|info| info.key == SortKey::Name).unwrap();
    assert_eq!(name.column, "sortable_name");
    assert_eq!(name.order, SortOrder::Ascending);
}
