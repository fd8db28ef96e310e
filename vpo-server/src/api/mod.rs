//! The daemon's JSON API.
//!
//! Everything under `/api` is JSON; `/health` is the load-balancer probe
//! and stays unauthenticated. When a shared token is configured every
//! other route requires HTTP Basic auth with the token as password.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;
use vpo_core::JobFilter;
use vpo_model::{JobKind, JobStatus};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/logs", get(get_job_logs))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/requeue", post(requeue_job))
        .route("/api/stats/summary", get(stats_summary))
        .route("/api/stats/recent", get(stats_recent))
        .route("/api/stats/trends", get(stats_trends))
        .route("/api/plugins", get(list_plugins))
        .route("/api/library/{id}", get(library_file))
        .route("/api/library/{id}/plugins", get(library_file_plugins))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body every handler funnels through.
#[derive(Debug)]
struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(what: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, what.into())
    }

    fn conflict(what: impl Into<String>) -> Self {
        Self(StatusCode::CONFLICT, what.into())
    }
}

impl From<vpo_core::CoreError> for ApiError {
    fn from(err: vpo_core::CoreError) -> Self {
        warn!("api error: {err}");
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

/// Basic-auth gate; active only when a token is configured.
async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.auth_token.as_deref() else {
        return next.run(request).await;
    };
    if authorized(&headers, expected) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"vpo\"")],
        Json(json!({ "error": "authentication required" })),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    // Username is ignored; the shared token is the password.
    text.split_once(':')
        .map(|(_, password)| password == expected)
        .unwrap_or(false)
}

async fn health(State(state): State<AppState>) -> Response {
    if state.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
            .into_response();
    }
    match state.queue.queue_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "jobs_queued": stats.queued,
                "jobs_running": stats.running,
            })),
        )
            .into_response(),
        Err(err) => {
            warn!("health check degraded: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    search: Option<String>,
    sort_by: Option<String>,
    sort_order: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = JobFilter {
        status: query.status.as_deref().and_then(JobStatus::parse),
        kind: query.kind.as_deref().and_then(JobKind::parse),
        since: query.since,
        search: query.search,
        sort_by: query.sort_by,
        sort_descending: query.sort_order.as_deref() == Some("desc"),
        limit: query.limit,
        offset: query.offset,
    };
    let jobs = state.queue.list(&filter).await?;
    let count = jobs.len();
    Ok(Json(json!({ "jobs": jobs, "count": count })))
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;
    Ok(Json(json!({ "job": job })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    offset: Option<usize>,
    limit: Option<usize>,
}

async fn get_job_logs(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = state.data_dir.job_log_path(id);
    if !path.exists() {
        return Err(ApiError::not_found(format!("no logs for job {id}")));
    }
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(500).min(5000);
    let all: Vec<&str> = text.lines().collect();
    let lines: Vec<&str> = all.iter().skip(offset).take(limit).copied().collect();
    Ok(Json(json!({
        "job_id": id,
        "offset": offset,
        "total_lines": all.len(),
        "lines": lines,
    })))
}

async fn cancel_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;
    if state.queue.cancel(id).await? {
        return Ok(Json(json!({ "cancelled": true })));
    }
    // A running job belongs to its worker; the queue does not reach in.
    Err(ApiError::conflict(format!(
        "job {id} is {} and cannot be cancelled",
        job.status
    )))
}

async fn requeue_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.queue.requeue(id).await? {
        Ok(Json(json!({ "requeued": true })))
    } else {
        Err(ApiError::conflict(format!(
            "job {id} is not failed or cancelled"
        )))
    }
}

async fn stats_summary(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state.store.stats_summary().await?;
    Ok(Json(json!({ "summary": summary })))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<u32>,
}

async fn stats_recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let recent = state
        .store
        .recent_stats(query.limit.unwrap_or(20).min(500))
        .await?;
    Ok(Json(json!({ "recent": recent })))
}

#[derive(Debug, Deserialize)]
struct TrendsQuery {
    days: Option<u32>,
}

async fn stats_trends(
    State(state): State<AppState>,
    Query(query): Query<TrendsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let trends = state
        .store
        .stats_trends(query.days.unwrap_or(30).min(365))
        .await?;
    Ok(Json(json!({ "trends": trends })))
}

async fn list_plugins(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let plugins = state.store.list_plugins().await?;
    Ok(Json(json!({ "plugins": plugins })))
}

async fn library_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (file_id, info) = state
        .store
        .file_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("file {id}")))?;
    Ok(Json(json!({ "id": file_id, "file": info })))
}

/// Plugin-supplied metadata blobs attached to one file.
async fn library_file_plugins(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.store.file_by_id(id).await?.is_none() {
        return Err(ApiError::not_found(format!("file {id}")));
    }
    let analyses = state.store.load_analyses(id).await?;
    Ok(Json(json!({ "id": id, "plugins": analyses.plugin_metadata })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::util::ServiceExt;
    use vpo_core::{Config, DataDir, Store, ToolRegistry};
    use vpo_model::{Job, JobKind};

    async fn test_state(auth_token: Option<&str>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(dir.path());
        data_dir.ensure().unwrap();
        let mut config = Config::default();
        config.auth_token = auth_token.map(str::to_string);
        let store = Store::open_in_memory().await.unwrap();
        let state = AppState::new(
            config,
            data_dir,
            Arc::new(ToolRegistry::from_parts(vec![])),
            store,
        );
        (state, dir)
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_queue_counts() {
        let (state, _dir) = test_state(None).await;
        let router = build_router(state);
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["jobs_queued"], 0);
    }

    #[tokio::test]
    async fn health_is_503_during_shutdown() {
        let (state, _dir) = test_state(None).await;
        state.begin_shutdown();
        let router = build_router(state);
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn jobs_listing_and_detail() {
        let (state, _dir) = test_state(None).await;
        let job = Job::new(JobKind::Apply, "/m/a.mkv".into(), Some("p".into()), 50);
        state.queue.enqueue(&job).await.unwrap();

        let router = build_router(state);
        let (status, body) = get(&router, "/api/jobs?status=queued").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = get(&router, &format!("/api/jobs/{}", job.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["kind"], "apply");

        let (status, _) = get(&router, &format!("/api/jobs/{}", uuid::Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_gates_api_but_not_health() {
        let (state, _dir) = test_state(Some("secret")).await;
        let router = build_router(state);

        let (status, _) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(&router, "/api/jobs").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let encoded = base64::engine::general_purpose::STANDARD.encode("user:secret");
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/jobs")
                    .header(header::AUTHORIZATION, format!("Basic {encoded}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_endpoints_respond() {
        let (state, _dir) = test_state(None).await;
        let router = build_router(state);
        for uri in ["/api/stats/summary", "/api/stats/recent", "/api/stats/trends"] {
            let (status, _) = get(&router, uri).await;
            assert_eq!(status, StatusCode::OK, "endpoint {uri}");
        }
    }

    #[test]
    fn basic_auth_token_check() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, "secret"));

        let encoded = base64::engine::general_purpose::STANDARD.encode("vpo:secret");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert!(authorized(&headers, "secret"));
        assert!(!authorized(&headers, "other"));

        let bad = base64::engine::general_purpose::STANDARD.encode("no-colon");
        headers.insert(header::AUTHORIZATION, format!("Basic {bad}").parse().unwrap());
        assert!(!authorized(&headers, "secret"));
    }
}
