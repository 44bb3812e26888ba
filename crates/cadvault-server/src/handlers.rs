//! HTTP handlers.
//!
//! Thin translation between requests and `Coordinator` calls. File bodies
//! travel as raw request/response bytes; everything else is JSON.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadvault_core::{
    CommitEvent, LockRecord, LockSummary, RevisionClass, RevisionMetadata, UserMessage,
    VaultError,
};
use cadvault_git::{CheckinRequest, Coordinator, UploadRequest};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, Result};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_ACTIVITY_LIMIT: usize = 20;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub branch: String,
    pub observers: usize,
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        branch: state.coordinator.config().branch.clone(),
        observers: state.coordinator.hub().observer_count(),
    })
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    #[serde(default)]
    pub grouped: bool,
    pub pattern: Option<String>,
}

/// GET /api/files?grouped=true&pattern=*.mcam
pub async fn list_files_handler(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Response> {
    if query.grouped {
        let groups = state.coordinator.list_groups(query.pattern).await?;
        Ok(Json(groups).into_response())
    } else {
        let files = state.coordinator.list_files(query.pattern).await?;
        Ok(Json(files).into_response())
    }
}

#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    pub path: String,
    /// Commit id (or any rev-parse expression); working copy when absent
    pub rev: Option<String>,
}

/// GET /api/files/content?path=...&rev=...
pub async fn file_content_handler(
    State(state): State<AppState>,
    Query(query): Query<ContentQuery>,
) -> Result<Response> {
    let bytes = match query.rev.as_deref().filter(|r| !r.trim().is_empty()) {
        Some(rev) => state.coordinator.read_file_at(&query.path, rev).await?,
        None => state.coordinator.read_file(&query.path).await?,
    };
    let name = query.path.rsplit('/').next().unwrap_or(&query.path).replace('"', "");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub path: String,
    pub limit: Option<usize>,
}

/// GET /api/history?path=...&limit=50
pub async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<CommitEvent>>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.coordinator.history(&query.path, limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct FileAction {
    pub path: String,
    pub user: String,
}

/// POST /api/checkout
pub async fn checkout_handler(
    State(state): State<AppState>,
    Json(req): Json<FileAction>,
) -> Result<Json<LockRecord>> {
    let record = state.coordinator.checkout(&req.path, &req.user).await?;
    info!("{} checked out {}", record.user, record.file);
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct CheckinQuery {
    pub path: String,
    pub user: String,
    #[serde(default)]
    pub class: RevisionClass,
    /// Explicit major for a major check-in
    pub major: Option<u32>,
    pub description: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// POST /api/checkin?path=...&user=...&class=minor (body: new file content)
pub async fn checkin_handler(
    State(state): State<AppState>,
    Query(query): Query<CheckinQuery>,
    body: Bytes,
) -> Result<Json<RevisionMetadata>> {
    let meta = state
        .coordinator
        .checkin(CheckinRequest {
            path: query.path,
            user: query.user,
            content: body.to_vec(),
            class: query.class,
            explicit_major: query.major,
            description: query.description,
            message: query.message,
        })
        .await?;
    Ok(Json(meta))
}

/// POST /api/cancel
pub async fn cancel_handler(
    State(state): State<AppState>,
    Json(req): Json<FileAction>,
) -> Result<StatusCode> {
    state.coordinator.cancel(&req.path, &req.user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub path: String,
    pub user: String,
    pub revision: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// POST /api/upload?path=...&user=...&revision=1.0 (body: file content)
pub async fn upload_handler(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<RevisionMetadata>)> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".into()));
    }
    let meta = state
        .coordinator
        .upload(UploadRequest {
            path: query.path,
            user: query.user,
            content: body.to_vec(),
            revision: query.revision,
            description: query.description,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(meta)))
}

#[derive(Debug, Deserialize)]
pub struct AdminAction {
    pub path: String,
    pub admin: String,
}

#[derive(Serialize)]
pub struct OverrideResponse {
    pub released: Option<LockRecord>,
}

/// POST /api/admin/override
pub async fn override_handler(
    State(state): State<AppState>,
    Json(req): Json<AdminAction>,
) -> Result<Json<OverrideResponse>> {
    let released = state.coordinator.admin_override(&req.path, &req.admin).await?;
    Ok(Json(OverrideResponse { released }))
}

/// POST /api/admin/delete
pub async fn delete_handler(
    State(state): State<AppState>,
    Json(req): Json<AdminAction>,
) -> Result<StatusCode> {
    state.coordinator.admin_delete(&req.path, &req.admin).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub path: String,
    pub admin: String,
    /// Commit whose changes are undone
    pub commit: String,
}

/// POST /api/admin/revert
pub async fn revert_handler(
    State(state): State<AppState>,
    Json(req): Json<RevertRequest>,
) -> Result<Json<RevisionMetadata>> {
    let meta = state
        .coordinator
        .revert(&req.path, &req.admin, &req.commit)
        .await?;
    Ok(Json(meta))
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub admin: String,
}

/// POST /api/admin/purge
pub async fn purge_handler(
    State(state): State<AppState>,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<Vec<LockRecord>>> {
    if !state.coordinator.config().is_admin(req.admin.trim()) {
        return Err(VaultError::Forbidden(format!("{} is not an admin", req.admin)).into());
    }
    Ok(Json(state.coordinator.purge_stale_locks().await?))
}

/// GET /api/locks
pub async fn locks_handler(State(state): State<AppState>) -> Result<Json<Vec<LockSummary>>> {
    Ok(Json(state.coordinator.list_locks().await?))
}

/// GET /api/authors
pub async fn authors_handler(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.coordinator.authors().await?))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

/// GET /api/activity?limit=20
pub async fn activity_handler(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<CommitEvent>>> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Ok(Json(state.coordinator.recent_activity(limit).await?))
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub from: String,
    pub to: String,
    pub text: String,
}

/// POST /api/messages
pub async fn post_message_handler(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<StatusCode> {
    state
        .coordinator
        .post_message(&req.from, &req.to, &req.text)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct ReadMessagesRequest {
    pub user: String,
}

/// POST /api/messages/read: returns and clears the caller's queue
pub async fn read_messages_handler(
    State(state): State<AppState>,
    Json(req): Json<ReadMessagesRequest>,
) -> Result<Json<Vec<UserMessage>>> {
    Ok(Json(state.coordinator.take_messages(&req.user).await?))
}
