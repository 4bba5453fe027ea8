/*
 * Copyright 2025-present ScyllaDB
 * SPDX-License-Identifier: LicenseRef-ScyllaDB-Source-Available-1.0
 */

use crate::ArtistId;
use crate::JobId;
use crate::engine::Engine;
use crate::engine::EngineExt;
use crate::error::ViewError;
use crate::info::Info;
use crate::jobs::Job;
use crate::jobs::JobStatus;
use crate::partition::SortValue;
use crate::similarity::Neighbor;
use crate::similarity::Subject;
use crate::sort_spec;
use crate::sort_spec::SortKey;
use crate::sort_spec::SortOrder;
use crate::sort_spec::ValueType;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use time::OffsetDateTime;
use tokio::sync::mpsc::Sender;
use tower_http::trace::TraceLayer;
use tracing::debug;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use uuid::Uuid;

#[derive(OpenApi)]
#[openapi(
     info(
        title = "Catalog Views API",
        description = "REST API for building sorted derived views of the artist catalog and for \
        similarity queries over artist embeddings.",
        license(
            name = "LicenseRef-ScyllaDB-Source-Available-1.0"
        ),
    ),
    tags(
        (
            name = "catalog-views-derived",
            description = "Operations for building derived tables and reading their top rows."
        ),
        (
            name = "catalog-views-similarity",
            description = "Nearest neighbors of an artist by embedding similarity."
        ),
        (
            name = "catalog-views-info",
            description = "Endpoints providing general information about the service."
        )
    ),
    components(
        schemas(
            ArtistId,
            JobId
        )
    ),
)]
struct ApiDoc;

#[derive(Clone)]
struct RoutesInnerState {
    engine: Sender<Engine>,
}

pub(crate) fn new(engine: Sender<Engine>) -> Router {
    let state = RoutesInnerState { engine };
    let (router, api) = new_open_api_router();
    router
        .with_state(state)
        .route(
            "/api-docs/openapi.json",
            get(move || {
                let api = api.clone();
                async move { response::Json(api) }
            }),
        )
        .layer(TraceLayer::new_for_http())
}

pub fn api() -> utoipa::openapi::OpenApi {
    new_open_api_router().1
}

fn new_open_api_router() -> (Router<RoutesInnerState>, utoipa::openapi::OpenApi) {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(
            OpenApiRouter::new()
                .routes(routes!(get_sort_keys))
                .routes(routes!(post_build))
                .routes(routes!(get_job))
                .routes(routes!(post_job_cancel))
                .routes(routes!(get_top))
                .routes(routes!(get_similar))
                .routes(routes!(get_info)),
        )
        .split_for_parts()
}

/// A human-readable description of the error that occurred.
#[derive(utoipa::ToSchema)]
struct ErrorMessage(#[allow(dead_code)] String);

impl IntoResponse for ViewError {
    fn into_response(self) -> Response {
        let status = match &self {
            ViewError::Validation(_) => StatusCode::BAD_REQUEST,
            ViewError::NotFound(_) => StatusCode::NOT_FOUND,
            ViewError::InvalidState(_) | ViewError::Conflict(_) => StatusCode::CONFLICT,
            ViewError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let msg = self.to_string();
        debug!("{status}: {msg}");
        (status, msg).into_response()
    }
}

fn parse_sort_key(sort_key: &str) -> Result<SortKey, ViewError> {
    sort_key.parse()
}

fn parse_job_id(job_id: &str) -> Result<JobId, ViewError> {
    job_id
        .parse::<Uuid>()
        .map(JobId::from)
        .map_err(|_| ViewError::NotFound(format!("unknown job: {job_id}")))
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
/// A registered sort key and the physical column it sorts by.
pub struct SortKeyInfo {
    pub key: SortKey,
    pub column: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub order: SortOrder,
}

#[utoipa::path(
    get,
    path = "/api/v1/sort-keys",
    tag = "catalog-views-derived",
    description = "Returns every sort key a derived table can be built for.",
    responses(
        (status = 200, description = "The registered sort keys.", body = [SortKeyInfo])
    )
)]
async fn get_sort_keys() -> response::Json<Vec<SortKeyInfo>> {
    response::Json(
        sort_spec::registry()
            .map(|spec| SortKeyInfo {
                key: spec.key,
                column: spec.column.to_string(),
                value_type: spec.value_type,
                order: spec.order,
            })
            .collect(),
    )
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug, Default)]
#[serde(default)]
pub struct StartBuildRequest {
    /// Number of buckets of a numeric derived table, the service default when absent. Ignored
    /// for text sort keys.
    pub bucket_count: Option<u32>,
    /// Truncate the derived table before the backfill.
    pub truncate_first: bool,
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
pub struct StartBuildResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[utoipa::path(
    post,
    path = "/api/v1/derived/{sort_key}/builds",
    tag = "catalog-views-derived",
    description = "Starts a background build of the derived table of a sort key. The build is \
    observed by polling its job.",
    params(
        ("sort_key" = String, Path, description = "A registered sort key.")
    ),
    request_body(content = Option<StartBuildRequest>, description = "Optional build settings, \
    defaults apply when the body is absent."),
    responses(
        (status = 202, description = "The build was accepted.", body = StartBuildResponse),
        (status = 400, description = "Unknown sort key or bucket count out of range.", body = ErrorMessage),
        (status = 409, description = "A build of the sort key is already running.", body = ErrorMessage)
    )
)]
async fn post_build(
    State(state): State<RoutesInnerState>,
    Path(sort_key): Path<String>,
    request: Option<response::Json<StartBuildRequest>>,
) -> Result<Response, ViewError> {
    let sort_key = parse_sort_key(&sort_key)?;
    // a request without a body builds with defaults
    let request = request.map(|response::Json(request)| request).unwrap_or_default();
    let job = state
        .engine
        .start_build(sort_key, request.bucket_count, request.truncate_first)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        response::Json(StartBuildResponse {
            job_id: job.id,
            // the backfill is under way once the build is accepted
            status: JobStatus::Building,
            started_at: job.started_at,
        }),
    )
        .into_response())
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
pub struct JobResponse {
    pub job_id: JobId,
    pub sort_key: SortKey,
    pub status: JobStatus,
    pub inserted: u64,
    /// Approximate size of the source table, 0 when unknown.
    pub total: u64,
    pub percent: u8,
    pub canceled: bool,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            percent: job.percent(),
            job_id: job.id,
            sort_key: job.sort_key,
            status: job.status,
            inserted: job.inserted,
            total: job.total,
            canceled: job.canceled,
            error: job.error,
            started_at: job.started_at,
            finished_at: job.finished_at,
            updated_at: job.updated_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}",
    tag = "catalog-views-derived",
    description = "Returns the state and progress of a build job.",
    params(
        ("job_id" = String, Path, description = "Id of a build job.")
    ),
    responses(
        (status = 200, description = "The job record.", body = JobResponse),
        (status = 404, description = "Unknown job.", body = ErrorMessage)
    )
)]
async fn get_job(
    State(state): State<RoutesInnerState>,
    Path(job_id): Path<String>,
) -> Result<response::Json<JobResponse>, ViewError> {
    let job = state.engine.get_job(parse_job_id(&job_id)?).await?;
    Ok(response::Json(job.into()))
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
pub struct CancelResponse {
    pub ok: bool,
    pub canceled: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/cancel",
    tag = "catalog-views-derived",
    description = "Requests cancellation of a build job. The job moves to CANCELED once the \
    backfill observes the request. Canceling a finished job is a no-op.",
    params(
        ("job_id" = String, Path, description = "Id of a build job.")
    ),
    responses(
        (status = 200, description = "Cancellation was requested.", body = CancelResponse),
        (status = 404, description = "Unknown job.", body = ErrorMessage)
    )
)]
async fn post_job_cancel(
    State(state): State<RoutesInnerState>,
    Path(job_id): Path<String>,
) -> Result<response::Json<CancelResponse>, ViewError> {
    state.engine.cancel_job(parse_job_id(&job_id)?).await?;
    Ok(response::Json(CancelResponse {
        ok: true,
        canceled: true,
    }))
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug, Default)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
pub struct TopItem {
    pub id: ArtistId,
    pub name: Option<String>,
    pub value: SortValue,
    pub image_url: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
pub struct TopResponse {
    pub sort_key: SortKey,
    pub items: Vec<TopItem>,
    pub limit: usize,
}

#[utoipa::path(
    get,
    path = "/api/v1/derived/{sort_key}/top",
    tag = "catalog-views-derived",
    description = "Returns the first rows of a derived table in the declared order of its sort key.",
    params(
        ("sort_key" = String, Path, description = "A registered sort key."),
        ("limit" = Option<usize>, Query, description = "Number of rows, 1 to 50, 10 by default.")
    ),
    responses(
        (status = 200, description = "The ranked rows.", body = TopResponse),
        (status = 400, description = "Unknown sort key or limit out of range.", body = ErrorMessage),
        (status = 404, description = "The derived table is not built yet.", body = ErrorMessage),
        (status = 500, description = "Storage failure.", body = ErrorMessage)
    )
)]
async fn get_top(
    State(state): State<RoutesInnerState>,
    Path(sort_key): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<response::Json<TopResponse>, ViewError> {
    let sort_key = parse_sort_key(&sort_key)?;
    let top = state.engine.get_top(sort_key, query.limit).await?;
    Ok(response::Json(TopResponse {
        sort_key: top.sort_key,
        items: top
            .rows
            .into_iter()
            .map(|row| TopItem {
                image_url: row.images.first().map(|image| image.url.clone()),
                id: row.id,
                name: row.name,
                value: row.value,
            })
            .collect(),
        limit: top.limit,
    }))
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema, PartialEq, Debug)]
pub struct SimilarResponse {
    pub subject: Subject,
    pub items: Vec<Neighbor>,
    pub limit: usize,
    pub from_cache: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub scored_at: OffsetDateTime,
}

#[utoipa::path(
    get,
    path = "/api/v1/artists/{id}/similar",
    tag = "catalog-views-similarity",
    description = "Returns the artists with the most similar embeddings, best first. Results are \
    cached for a while per artist and limit.",
    params(
        ("id" = String, Path, description = "Id of the subject artist."),
        ("limit" = Option<usize>, Query, description = "Number of neighbors, 1 to 25, 10 by default.")
    ),
    responses(
        (status = 200, description = "The ranked neighbors.", body = SimilarResponse),
        (status = 400, description = "Limit out of range.", body = ErrorMessage),
        (status = 404, description = "Unknown artist.", body = ErrorMessage),
        (status = 409, description = "The artist has no embedding.", body = ErrorMessage),
        (status = 500, description = "Storage failure.", body = ErrorMessage)
    )
)]
async fn get_similar(
    State(state): State<RoutesInnerState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<response::Json<SimilarResponse>, ViewError> {
    let similar = state.engine.similar(id.into(), query.limit).await?;
    Ok(response::Json(SimilarResponse {
        subject: similar.scored.subject,
        items: similar.scored.items,
        limit: similar.limit,
        from_cache: similar.from_cache,
        scored_at: similar.scored.scored_at,
    }))
}

#[derive(serde::Deserialize, serde::Serialize, utoipa::ToSchema)]
pub struct InfoResponse {
    /// The name of the service.
    pub service: String,
    /// The version of the service.
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/info",
    tag = "catalog-views-info",
    description = "Returns information about the service serving this API.",
    responses(
        (status = 200, description = "Service information.", body = InfoResponse)
    )
)]
async fn get_info() -> response::Json<InfoResponse> {
    response::Json(InfoResponse {
        version: Info::version().to_string(),
        service: Info::name().to_string(),
    })
}
