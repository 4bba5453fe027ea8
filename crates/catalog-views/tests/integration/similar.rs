/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::db_basic;
use crate::db_basic::DbBasic;
use crate::enable_tracing;
use crate::run_service;
use catalog_views::ArtistId;
use catalog_views::Config;
use catalog_views::db::Db;
use itertools::Itertools;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

fn id(idx: usize) -> ArtistId {
    format!("artist-{idx:02}").into()
}

/// artist-00 is the subject, artist-01 is almost parallel to it, artist-02 is orthogonal and
/// artist-03 has no embedding.
fn neighbors() -> (Sender<Db>, DbBasic) {
    let (db_actor, db) = db_basic::new();
    db.add_artists([
        db_basic::artist(0, Some(10), Some(vec![1.0, 0.0])),
        db_basic::artist(1, Some(20), Some(vec![0.9, 0.1])),
        db_basic::artist(2, Some(30), Some(vec![0.0, 1.0])),
        db_basic::artist(3, Some(40), None),
    ]);
    (db_actor, db)
}

#[tokio::test]
async fn similar_ranks_neighbors_by_cosine() {
    enable_tracing();
    let (db_actor, _db) = neighbors();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let similar = client.similar(&id(0), Some(2)).await.unwrap();

    assert_eq!(similar.subject.id, id(0));
    assert_eq!(similar.subject.name.as_deref(), Some("Artist 00"));
    assert_eq!(similar.limit, 2);
    assert!(!similar.from_cache);
    assert_eq!(
        similar.items.iter().map(|item| item.id.clone()).collect_vec(),
        [id(1), id(2)]
    );
    assert!((similar.items[0].score - 0.9939).abs() < 1e-3);
    assert_eq!(similar.items[0].score_percent, 99);
    assert_eq!(similar.items[1].score.abs(), 0.0);
    assert_eq!(similar.items[1].score_percent, 0);
}

#[tokio::test]
async fn repeated_similar_is_served_from_cache() {
    enable_tracing();
    let (db_actor, db) = neighbors();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let first = client.similar(&id(0), Some(2)).await.unwrap();
    let scans = db.scans();

    let second = client.similar(&id(0), Some(2)).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.items, first.items);
    assert_eq!(second.scored_at, first.scored_at);
    assert_eq!(db.scans(), scans);

    // a different limit is a different entry
    let third = client.similar(&id(0), Some(1)).await.unwrap();
    assert!(!third.from_cache);
    assert_eq!(third.items.len(), 1);
    assert!(db.scans() > scans);
}

#[tokio::test]
async fn cached_result_expires() {
    enable_tracing();
    let (db_actor, _db) = neighbors();
    let config = Config {
        similar_cache_ttl: Duration::from_millis(200),
        ..Default::default()
    };
    let (client, _server, _config_tx) = run_service(db_actor, config).await;

    assert!(!client.similar(&id(0), None).await.unwrap().from_cache);
    assert!(client.similar(&id(0), None).await.unwrap().from_cache);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!client.similar(&id(0), None).await.unwrap().from_cache);
}

#[tokio::test]
async fn cache_can_be_disabled_at_runtime() {
    enable_tracing();
    let (db_actor, _db) = neighbors();
    let (client, _server, config_tx) = run_service(db_actor, Config::default()).await;

    client.similar(&id(0), None).await.unwrap();
    assert!(client.similar(&id(0), None).await.unwrap().from_cache);

    config_tx.send_modify(|config| {
        *config = Arc::new(Config {
            similar_cache_capacity: 0,
            ..(**config).clone()
        })
    });

    // entries put before the change may still be served, new keys are never cached
    assert!(!client.similar(&id(1), None).await.unwrap().from_cache);
    assert!(!client.similar(&id(1), None).await.unwrap().from_cache);
}

#[tokio::test]
async fn similar_errors() {
    enable_tracing();
    let (db_actor, _db) = neighbors();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let response = client.get_similar("artist-99", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.get_similar("artist-03", None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    for limit in [0, 26] {
        let response = client.get_similar("artist-00", Some(limit)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{limit}");
    }
}
