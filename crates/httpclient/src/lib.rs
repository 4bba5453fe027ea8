/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use catalog_views::ArtistId;
use catalog_views::JobId;
use catalog_views::httproutes::CancelResponse;
use catalog_views::httproutes::InfoResponse;
use catalog_views::httproutes::JobResponse;
use catalog_views::httproutes::SimilarResponse;
use catalog_views::httproutes::SortKeyInfo;
use catalog_views::httproutes::StartBuildRequest;
use catalog_views::httproutes::StartBuildResponse;
use catalog_views::httproutes::TopResponse;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;

pub struct HttpClient {
    client: Client,
    url_api: String,
    url_docs: String,
}

impl HttpClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            url_api: format!("http://{addr}/api/v1"),
            url_docs: format!("http://{addr}/api-docs"),
            client: Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        self.url_api.as_str()
    }

    pub async fn sort_keys(&self) -> Vec<SortKeyInfo> {
        self.client
            .get(format!("{}/sort-keys", self.url_api))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Starts a build and decodes the accepted response.
    pub async fn start_build(
        &self,
        sort_key: &str,
        request: &StartBuildRequest,
    ) -> anyhow::Result<StartBuildResponse> {
        success_json(self.post_build(sort_key, request).await).await
    }

    pub async fn post_build<T: Serialize>(&self, sort_key: &str, data: &T) -> reqwest::Response {
        self.client
            .post(format!("{}/derived/{sort_key}/builds", self.url_api))
            .json(data)
            .send()
            .await
            .unwrap()
    }

    /// Posts a build request without any body.
    pub async fn post_build_without_body(&self, sort_key: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/derived/{sort_key}/builds", self.url_api))
            .send()
            .await
            .unwrap()
    }

    pub async fn job(&self, job_id: &JobId) -> anyhow::Result<JobResponse> {
        success_json(self.get_job(&job_id.to_string()).await).await
    }

    pub async fn get_job(&self, job_id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/jobs/{job_id}", self.url_api))
            .send()
            .await
            .unwrap()
    }

    pub async fn cancel(&self, job_id: &JobId) -> anyhow::Result<CancelResponse> {
        let response = self
            .client
            .post(format!("{}/jobs/{job_id}/cancel", self.url_api))
            .send()
            .await?;
        success_json(response).await
    }

    pub async fn top(&self, sort_key: &str, limit: Option<usize>) -> anyhow::Result<TopResponse> {
        success_json(self.get_top(sort_key, limit).await).await
    }

    pub async fn get_top(&self, sort_key: &str, limit: Option<usize>) -> reqwest::Response {
        let mut request = self
            .client
            .get(format!("{}/derived/{sort_key}/top", self.url_api));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        request.send().await.unwrap()
    }

    pub async fn similar(
        &self,
        id: &ArtistId,
        limit: Option<usize>,
    ) -> anyhow::Result<SimilarResponse> {
        success_json(self.get_similar(id.as_ref(), limit).await).await
    }

    pub async fn get_similar(&self, id: &str, limit: Option<usize>) -> reqwest::Response {
        let mut request = self
            .client
            .get(format!("{}/artists/{id}/similar", self.url_api));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        request.send().await.unwrap()
    }

    pub async fn info(&self) -> InfoResponse {
        self.client
            .get(format!("{}/info", self.url_api))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    pub async fn openapi(&self) -> serde_json::Value {
        self.client
            .get(format!("{}/openapi.json", self.url_docs))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

async fn success_json<T: DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    if response.status().is_success() {
        Ok(response.json::<T>().await?)
    } else {
        let status = response.status();
        let error_text = response.text().await?;
        Err(anyhow::anyhow!("HTTP {status}: {error_text}"))
    }
}
