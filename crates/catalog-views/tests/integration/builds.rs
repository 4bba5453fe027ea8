/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::db_basic;
use crate::db_basic::DbBasic;
use crate::enable_tracing;
use crate::run_service;
use crate::wait_for_value;
use catalog_views::ArtistId;
use catalog_views::Config;
use catalog_views::JobId;
use catalog_views::db::Db;
use catalog_views::httproutes::JobResponse;
use catalog_views::httproutes::StartBuildRequest;
use catalog_views::httproutes::StartBuildResponse;
use catalog_views::jobs::JobStatus;
use catalog_views::partition;
use catalog_views::partition::SortValue;
use catalog_views::sort_spec::SortKey;
use httpclient::HttpClient;
use itertools::Itertools;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

const ROWS: usize = 23;

fn followers(idx: usize) -> Option<i64> {
    (![4, 11, 18].contains(&idx)).then_some((idx as i64 + 1) * 1000)
}

fn catalog() -> (Sender<Db>, DbBasic) {
    let (db_actor, db) = db_basic::new();
    db.add_artists((0..ROWS).map(|idx| db_basic::artist(idx, followers(idx), None)));
    (db_actor, db)
}

async fn wait_for_terminal(client: &HttpClient, job_id: &JobId) -> JobResponse {
    wait_for_value(
        async || {
            client
                .job(job_id)
                .await
                .ok()
                .filter(|job| job.status.is_terminal())
        },
        "build job finishes",
    )
    .await
}

fn buckets(count: u32) -> StartBuildRequest {
    StartBuildRequest {
        bucket_count: Some(count),
        truncate_first: false,
    }
}

#[tokio::test]
async fn build_followers_and_read_top() {
    enable_tracing();
    let (db_actor, db) = catalog();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let started = client.start_build("followers", &buckets(4)).await.unwrap();
    assert_eq!(started.status, JobStatus::Building);

    let job = wait_for_terminal(&client, &started.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.sort_key, SortKey::Followers);
    assert_eq!(job.inserted, 20);
    assert_eq!(job.total, ROWS as u64);
    assert!(!job.canceled);
    assert!(job.finished_at.is_some());

    let rows = db.derived_rows(&partition::table_name(SortKey::Followers));
    assert_eq!(rows.len(), 20);
    assert!(rows.iter().all(|row| (0..4).contains(&row.bucket.unwrap())));

    let top = client.top("followers", Some(5)).await.unwrap();
    assert_eq!(top.sort_key, SortKey::Followers);
    assert_eq!(top.limit, 5);
    let expected = (0..ROWS)
        .filter_map(followers)
        .sorted()
        .rev()
        .take(5)
        .map(SortValue::Integer)
        .collect_vec();
    assert_eq!(
        top.items.iter().map(|item| item.value.clone()).collect_vec(),
        expected
    );
    assert_eq!(top.items[0].id, ArtistId::from("artist-22"));
    assert_eq!(top.items[0].name.as_deref(), Some("Artist 22"));
    assert_eq!(top.items[0].image_url.as_deref(), Some("http://img/22"));
}

#[tokio::test]
async fn build_text_key_reads_ascending() {
    enable_tracing();
    let (db_actor, _db) = catalog();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let started = client
        .start_build("name", &StartBuildRequest::default())
        .await
        .unwrap();
    let job = wait_for_terminal(&client, &started.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.inserted, ROWS as u64);
    assert_eq!(job.percent, 100);

    // a text table is read with one bounded scan, so only the order of the returned page holds
    let top = client.top("name", Some(3)).await.unwrap();
    assert_eq!(top.items.len(), 3);
    let values = top.items.iter().map(|item| item.value.clone()).collect_vec();
    assert!(values.is_sorted(), "{values:?}");
    for item in top.items.iter() {
        let SortValue::Text(name) = &item.value else {
            panic!("text value expected, got {:?}", item.value);
        };
        assert_eq!(*name, item.id.to_string().replace('-', " "));
        assert_eq!(item.name.as_ref().map(|name| name.to_lowercase()), Some(name.clone()));
    }
}

#[tokio::test]
async fn build_without_body_uses_defaults() {
    enable_tracing();
    let (db_actor, db) = catalog();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let response = client.post_build_without_body("followers").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let started: StartBuildResponse = response.json().await.unwrap();
    assert_eq!(started.status, JobStatus::Building);

    let job = wait_for_terminal(&client, &started.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.inserted, 20);

    let default_buckets = Config::default().default_bucket_count.get() as i32;
    let rows = db.derived_rows(&partition::table_name(SortKey::Followers));
    assert!(
        rows.iter()
            .all(|row| (0..default_buckets).contains(&row.bucket.unwrap()))
    );
}

#[tokio::test]
async fn rebuild_does_not_duplicate_rows() {
    enable_tracing();
    let (db_actor, db) = catalog();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;
    let table = partition::table_name(SortKey::Followers);

    for truncate_first in [false, false, true] {
        let request = StartBuildRequest {
            bucket_count: Some(8),
            truncate_first,
        };
        let started = client.start_build("followers", &request).await.unwrap();
        let job = wait_for_terminal(&client, &started.job_id).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(db.derived_rows(&table).len(), 20);
    }
}

#[tokio::test]
async fn cancel_stops_a_running_build() {
    enable_tracing();
    let (db_actor, db) = catalog();
    db.set_insert_delay(Duration::from_millis(100));
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let started = client.start_build("followers", &buckets(4)).await.unwrap();
    let canceled = client.cancel(&started.job_id).await.unwrap();
    assert!(canceled.ok);
    assert!(canceled.canceled);

    let job = wait_for_terminal(&client, &started.job_id).await;
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.canceled);
    assert!(job.inserted < 20);

    // canceling a finished job is accepted and changes nothing
    client.cancel(&started.job_id).await.unwrap();
    assert_eq!(
        client.job(&started.job_id).await.unwrap().status,
        JobStatus::Canceled
    );
}

#[tokio::test]
async fn concurrent_build_of_same_key_conflicts() {
    enable_tracing();
    let (db_actor, db) = catalog();
    db.set_insert_delay(Duration::from_millis(100));
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let started = client.start_build("followers", &buckets(4)).await.unwrap();

    let response = client.post_build("followers", &buckets(4)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // other keys are independent
    let other = client
        .start_build("popularity", &StartBuildRequest::default())
        .await
        .unwrap();

    client.cancel(&started.job_id).await.unwrap();
    client.cancel(&other.job_id).await.unwrap();
    wait_for_terminal(&client, &started.job_id).await;
    wait_for_terminal(&client, &other.job_id).await;

    let retry = client.start_build("followers", &buckets(4)).await.unwrap();
    client.cancel(&retry.job_id).await.unwrap();
}

#[tokio::test]
async fn invalid_build_requests_are_rejected() {
    enable_tracing();
    let (db_actor, _db) = db_basic::new();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    for (sort_key, bucket_count) in [
        ("genres", None),
        ("FOLLOWERS", None),
        ("followers", Some(0)),
        ("followers", Some(1025)),
    ] {
        let request = StartBuildRequest {
            bucket_count,
            truncate_first: false,
        };
        let response = client.post_build(sort_key, &request).await;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "{sort_key} {bucket_count:?}"
        );
    }
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    enable_tracing();
    let (db_actor, _db) = db_basic::new();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let response = client.get_job(&JobId::new().to_string()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.get_job("not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert!(client.cancel(&JobId::new()).await.is_err());
}

#[tokio::test]
async fn top_of_unbuilt_table_is_not_found() {
    enable_tracing();
    let (db_actor, _db) = db_basic::new();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let response = client.get_top("followers", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.get_top("genres", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn top_reports_limit_and_storage_errors() {
    enable_tracing();
    let (db_actor, db) = catalog();
    let (client, _server, _config_tx) = run_service(db_actor, Config::default()).await;

    let started = client
        .start_build("popularity", &StartBuildRequest::default())
        .await
        .unwrap();
    wait_for_terminal(&client, &started.job_id).await;

    let top = client.top("popularity", None).await.unwrap();
    assert_eq!(top.limit, 10);
    assert_eq!(top.items.len(), 10);

    for limit in [0, 51] {
        let response = client.get_top("popularity", Some(limit)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{limit}");
    }

    db.set_fail_query_derived(true);
    let response = client.get_top("popularity", Some(5)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
