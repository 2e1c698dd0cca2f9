//! JSON HTTP surface: webhook ingestion, job administration, stats, and
//! live configuration.

use crate::auth::{ApiKeyAuth, AuthError};
use crate::config::{self, Config};
use crate::db::{Db, JobStatus};
use crate::error::ForgeError;
use crate::hardware::Capabilities;
use crate::ingest::{self, IngestDecision, WebhookPayload};
use crate::paths::PathValidator;
use crate::worker::WorkerHandle;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

/// Process-wide state threaded through every handler.
pub struct App {
    pub db: Arc<Db>,
    pub config: Arc<RwLock<Config>>,
    pub caps: Arc<Capabilities>,
    pub worker: Arc<WorkerHandle>,
}

pub type SharedApp = Arc<App>;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        let status = match &err {
            ForgeError::Validation(_) | ForgeError::Precondition(_) => StatusCode::BAD_REQUEST,
            ForgeError::NotFound(_) => StatusCode::NOT_FOUND,
            ForgeError::NotReady | ForgeError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            ForgeError::ResourceExhausted(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.message())
    }
}

pub fn router(app: SharedApp) -> Router {
    Router::new()
        .route(
            "/webhook/arm",
            post(arm_webhook).layer(DefaultBodyLimit::max(ingest::MAX_PAYLOAD_BYTES)),
        )
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id", delete(delete_job))
        .route("/stats", get(get_stats))
        .route("/config", get(get_config).patch(patch_config))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn auth_for(app: &App) -> ApiKeyAuth {
    ApiKeyAuth::from_config(&*app.config.read().await)
}

async fn health(State(app): State<SharedApp>) -> Json<serde_json::Value> {
    let config = app.config.read().await;
    Json(json!({
        "status": "healthy",
        "worker_running": app.worker.is_running(),
        "queue_size": app.worker.queue_size(),
        "gpu_support": app.caps.gpu_support(),
        "config": config.public_view(),
        "require_api_auth": config.require_api_auth,
        "webhook_secret_configured": !config.webhook_secret.is_empty(),
    }))
}

async fn arm_webhook(
    State(app): State<SharedApp>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> Result<Response, ApiError> {
    auth_for(&app)
        .await
        .verify_webhook_secret(header(&headers, "x-webhook-secret"))?;

    if !app.worker.is_running() {
        return Err(ForgeError::NotReady.into());
    }

    match ingest::evaluate(&payload) {
        Ok(IngestDecision::Queued { title, arm_job_id }) => {
            let raw_path = app.config.read().await.raw_path.clone();
            // Belt and braces: the guard re-checks the already-screened
            // title against the raw root before it becomes a source path.
            let validator = PathValidator::new([Path::new(&raw_path)]);
            let source_path = match validator.validate(&title) {
                Ok(path) => path,
                Err(_) => {
                    return Ok((
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "status": "error", "reason": "invalid path" })),
                    )
                        .into_response())
                }
            };
            app.worker
                .queue_job(
                    &source_path.to_string_lossy(),
                    &title,
                    arm_job_id.as_deref(),
                    None,
                )
                .await?;
            Ok(Json(json!({
                "status": "queued",
                "path": title,
                "queue_size": app.worker.queue_size(),
            }))
            .into_response())
        }
        Ok(IngestDecision::Ignored) => Ok(Json(json!({
            "status": "ignored",
            "reason": "not a completion event",
        }))
        .into_response()),
        Err(ForgeError::Validation(reason)) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "reason": reason })),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_jobs(
    State(app): State<SharedApp>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_for(&app)
        .await
        .authenticate(header(&headers, "x-api-key"))?;

    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<JobStatus>()?),
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);

    let (jobs, total) = app.db.list_jobs(status, limit, offset).await?;
    Ok(Json(json!({
        "jobs": jobs,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

async fn retry_job(
    State(app): State<SharedApp>,
    UrlPath(job_id): UrlPath<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_for(&app)
        .await
        .require_admin(header(&headers, "x-api-key"))?;

    if !app.worker.is_running() {
        return Err(ForgeError::NotReady.into());
    }

    let job = app
        .db
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    if job.status != JobStatus::Failed {
        return Err(ApiError::bad_request("Job is not in failed state"));
    }

    let max_retry_count = app.config.read().await.max_retry_count;
    if job.retry_count >= max_retry_count {
        return Err(ApiError::bad_request(format!(
            "Maximum retry limit reached ({max_retry_count})"
        )));
    }

    app.db.reset_for_retry(job_id).await?;
    app.worker
        .queue_job(
            &job.source_path,
            &job.title,
            job.arm_job_id.as_deref(),
            Some(job_id),
        )
        .await?;

    Ok(Json(json!({
        "status": "queued",
        "job_id": job_id,
        "retry_count": job.retry_count + 1,
    })))
}

async fn delete_job(
    State(app): State<SharedApp>,
    UrlPath(job_id): UrlPath<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_for(&app)
        .await
        .require_admin(header(&headers, "x-api-key"))?;

    app.db.delete_job(job_id).await?;
    Ok(Json(json!({ "status": "deleted", "job_id": job_id })))
}

async fn get_stats(
    State(app): State<SharedApp>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_for(&app)
        .await
        .authenticate(header(&headers, "x-api-key"))?;

    let counts = app.db.count_jobs_by_status().await?;
    let mut stats = serde_json::Map::new();
    for (status, count) in counts {
        stats.insert(status, json!(count));
    }
    stats.insert("worker_running".into(), json!(app.worker.is_running()));
    stats.insert("current_job".into(), json!(app.worker.current_job().await));
    Ok(Json(serde_json::Value::Object(stats)))
}

async fn get_config(
    State(app): State<SharedApp>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_for(&app)
        .await
        .authenticate(header(&headers, "x-api-key"))?;

    Ok(Json(app.config.read().await.public_view()))
}

/// PATCH /config: validate every key against the allow-list and schema
/// before anything persists, then write the overrides and swap the live
/// config in one step.
async fn patch_config(
    State(app): State<SharedApp>,
    headers: HeaderMap,
    Json(patch): Json<BTreeMap<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_for(&app)
        .await
        .require_admin(header(&headers, "x-api-key"))?;

    let mut normalized: Vec<(String, String)> = Vec::with_capacity(patch.len());
    for (key, value) in &patch {
        if config::key_kind(key).is_none() {
            return Err(ApiError::bad_request(format!(
                "Unknown configuration key: {key}"
            )));
        }
        let raw = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => {
                return Err(ApiError::unprocessable(format!(
                    "Unsupported value type for {key}"
                )))
            }
        };
        let accepted = config::validate_value(key, &raw)
            .map_err(|e| ApiError::unprocessable(e.to_string()))?;
        normalized.push((key.clone(), accepted));
    }

    for (key, value) in &normalized {
        app.db.upsert_override(key, value).await?;
    }

    {
        let mut live = app.config.write().await;
        let mut updated = live.clone();
        for (key, value) in &normalized {
            updated.set_key(key, value)?;
        }
        *live = updated;
    }

    Ok(Json(json!({
        "status": "updated",
        "updated": normalized.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        "config": app.config.read().await.public_view(),
    })))
}
