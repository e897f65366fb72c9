//! HTTP surface. Every route lives under `/api`; errors are `{"error": msg}`.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    account::{AccountError, AccountView, QuotaLedger},
    jobs::{DownloadCoordinator, DownloadError, JobStatus},
    media::VideoInfoPayload,
    quality::Quality,
    retrieval::{ArtifactNotFound, RetrievalStore},
    session::{SessionRegistry, Unauthorized},
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: QuotaLedger,
    pub sessions: Arc<SessionRegistry>,
    pub coordinator: DownloadCoordinator,
    pub retrieval: Arc<RetrievalStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/user", get(current_user))
        .route("/api/upgrade", post(upgrade))
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/jobs/{job_id}", get(job_status))
        .route(
            "/api/download-file/{handle}/{file_name}",
            get(download_file),
        )
        .with_state(state)
}

#[derive(Debug)]
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

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "request failed: {}", self.message);
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<Unauthorized> for ApiError {
    fn from(err: Unauthorized) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, err.to_string())
    }
}

impl From<ArtifactNotFound> for ApiError {
    fn from(err: ArtifactNotFound) -> Self {
        Self::new(StatusCode::NOT_FOUND, err.to_string())
    }
}

impl From<AccountError> for ApiError {
    fn from(err: AccountError) -> Self {
        let status = match &err {
            AccountError::NotFound => StatusCode::NOT_FOUND,
            AccountError::AlreadyExists | AccountError::MissingCredentials => {
                StatusCode::BAD_REQUEST
            }
            AccountError::BadCredentials => StatusCode::UNAUTHORIZED,
            AccountError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::Unauthorized => StatusCode::UNAUTHORIZED,
            DownloadError::InvalidSource(_)
            | DownloadError::SourceUnresolvable(_)
            | DownloadError::NoSuitableFormat(_) => StatusCode::BAD_REQUEST,
            DownloadError::QuotaExceeded | DownloadError::PremiumRequired(_) => {
                StatusCode::FORBIDDEN
            }
            DownloadError::NotFound => StatusCode::NOT_FOUND,
            DownloadError::TranscodeFailed(_) | DownloadError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Reads the session token from `Authorization`, with or without a `Bearer`
/// prefix.
fn session_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(value.strip_prefix("Bearer ").unwrap_or(value).trim())
}

impl AppState {
    fn authenticate(&self, headers: &HeaderMap) -> ApiResult<String> {
        Ok(self.sessions.authenticate(session_token(headers))?)
    }
}

#[derive(Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub token: String,
    pub user: AccountView,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub success: bool,
    pub user: AccountView,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Deserialize)]
pub struct VideoInfoRequest {
    pub url: String,
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub download_url: String,
    pub download_count: u32,
    pub job_id: String,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<Json<AuthResponse>> {
    let account = state.ledger.register(&body.email, &body.password).await?;
    let token = state.sessions.create_session(&account.id);
    info!(account = %account.id, "account registered");
    Ok(Json(AuthResponse {
        success: true,
        token,
        user: account.view(),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> ApiResult<Json<AuthResponse>> {
    let account = state.ledger.verify(&body.email, &body.password).await?;
    let token = state.sessions.create_session(&account.id);
    Ok(Json(AuthResponse {
        success: true,
        token,
        user: account.view(),
    }))
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SuccessResponse>> {
    state.authenticate(&headers)?;
    if let Some(token) = session_token(&headers) {
        state.sessions.revoke(token);
    }
    Ok(Json(SuccessResponse { success: true }))
}

async fn current_user(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<AccountView>> {
    let account_id = state.authenticate(&headers)?;
    let account = state.ledger.account(&account_id).await?;
    Ok(Json(account.view()))
}

async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<AccountResponse>> {
    let account_id = state.authenticate(&headers)?;
    let account = state.ledger.upgrade(&account_id).await?;
    info!(account = %account.id, "account upgraded to premium");
    Ok(Json(AccountResponse {
        success: true,
        user: account.view(),
    }))
}

async fn video_info(
    State(state): State<AppState>,
    Json(body): Json<VideoInfoRequest>,
) -> ApiResult<Json<VideoInfoPayload>> {
    let meta = state.coordinator.video_info(&body.url).await?;
    Ok(Json(VideoInfoPayload::from(&meta)))
}

async fn start_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let account_id = state.authenticate(&headers)?;
    let quality: Quality = body
        .quality
        .parse()
        .map_err(|err: crate::quality::QualityParseError| {
            DownloadError::InvalidSource(err.to_string())
        })?;
    let staged = state
        .coordinator
        .submit(&account_id, &body.url, quality)
        .await?;
    Ok(Json(DownloadResponse {
        download_url: staged.download_url(),
        download_count: staged.download_count,
        job_id: staged.job_id,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(job_id): AxumPath<String>,
) -> ApiResult<Json<JobStatus>> {
    let account_id = state.authenticate(&headers)?;
    Ok(Json(state.coordinator.job_status(&job_id, &account_id)?))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath((handle, file_name)): AxumPath<(String, String)>,
) -> ApiResult<Response> {
    let served = state.retrieval.fetch(&handle, &file_name).await?;
    info!(%handle, file = %served.file_name, size = served.size, "serving download");

    let mime = MimeGuess::from_path(&served.file_name).first_or_octet_stream();
    let disposition = format!("attachment; filename=\"{}\"", served.file_name);
    let mut response = Body::from_stream(served.body).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(served.size));
    Ok(response)
}
