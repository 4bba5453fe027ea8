/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::db_basic;
use crate::enable_tracing;
use crate::run_service;
use catalog_views::Config;

#[tokio::test]
async fn openapi_document_lists_every_route() {
    enable_tracing();
    let (db_actor, _db) = db_basic::new();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let api = client.openapi().await;

    assert_eq!(api["info"]["title"], "Catalog Views API");
    let paths = api["paths"].as_object().unwrap();
    for (path, method) in [
        ("/api/v1/sort-keys", "get"),
        ("/api/v1/derived/{sort_key}/builds", "post"),
        ("/api/v1/jobs/{job_id}", "get"),
        ("/api/v1/jobs/{job_id}/cancel", "post"),
        ("/api/v1/derived/{sort_key}/top", "get"),
        ("/api/v1/artists/{id}/similar", "get"),
        ("/api/v1/info", "get"),
    ] {
        assert!(
            paths.get(path).and_then(|item| item.get(method)).is_some(),
            "missing {method} {path}"
        );
    }
}

#[test]
fn generated_document_contains_top_route() {
    let api = catalog_views::httproutes::api();
    assert!(api.paths.paths.contains_key("/api/v1/derived/{sort_key}/top"));
}
