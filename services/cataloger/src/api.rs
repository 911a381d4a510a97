//! HTTP ingress: upload, status polling and delete requests.
//!
//! Uploads and deletes only hand work to the pipeline; the catalog itself is
//! written by the workers behind the queues.

use crate::config::ApiConfig;
use crate::document_store::DocumentStore;
use crate::object_store::{extension_for, is_key_segment, ObjectStore};
use crate::status::{StatusError, StatusQueryService, StatusView};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use comicvault_pipeline::{DeleteRequested, PipelineProducer, ProducerError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Where the API sends pipeline events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn image_uploaded(&self, url: &str) -> Result<(), ProducerError>;

    async fn delete_requested(&self, request: &DeleteRequested) -> Result<(), ProducerError>;
}

#[async_trait]
impl EventPublisher for PipelineProducer {
    async fn image_uploaded(&self, url: &str) -> Result<(), ProducerError> {
        self.publish_image_uploaded(url).await.map(|_| ())
    }

    async fn delete_requested(&self, request: &DeleteRequested) -> Result<(), ProducerError> {
        self.publish_delete_requested(request).await.map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing caller identity")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("unsupported content type {0:?}")]
    UnsupportedMediaType(String),

    #[error("upload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0}")]
    Internal(String),
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_MEDIA_TYPE")
            }
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub objects: Arc<dyn ObjectStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub status: Arc<StatusQueryService>,
    pub publisher: Arc<dyn EventPublisher>,
    pub owner_header: String,
    pub max_upload_bytes: usize,
}

impl AppState {
    fn owner(&self, headers: &HeaderMap) -> Result<String, ApiError> {
        headers
            .get(self.owner_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
            .map(str::to_string)
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub blob_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Poll `/api/v1/status` with this value
    pub blob_name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub comic_id: Uuid,
    pub status: &'static str,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/status", get(check_status))
        .route(
            "/api/v1/comics",
            post(upload_comic).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/v1/comics/:comic_id", delete(delete_comic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "comicvault-cataloger"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.documents.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state, headers))]
async fn check_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StatusQuery>,
) -> Result<Json<StatusView>, ApiError> {
    let owner = state.owner(&headers)?;
    let fragment = params.blob_name.unwrap_or_default();

    match state.status.query(&owner, &fragment).await {
        Ok(view) => Ok(Json(view)),
        Err(StatusError::EmptyFragment) => {
            Err(ApiError::BadRequest("blob_name is required".to_string()))
        }
        Err(StatusError::Store(e)) => {
            error!(error = %e, "Status lookup failed");
            Err(ApiError::Internal("status lookup failed".to_string()))
        }
    }
}

#[instrument(skip(state, headers, body), fields(size_bytes = body.len()))]
async fn upload_comic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let owner = state.owner(&headers)?;
    // The owner becomes the first key segment and is read back as the record's user_id
    if !is_key_segment(&owner) {
        return Err(ApiError::BadRequest(
            "caller identity cannot be used as a storage path".to_string(),
        ));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let extension = extension_for(content_type)
        .ok_or_else(|| ApiError::UnsupportedMediaType(content_type.to_string()))?;

    if body.is_empty() {
        return Err(ApiError::BadRequest("empty upload".to_string()));
    }
    if body.len() > state.max_upload_bytes {
        return Err(ApiError::PayloadTooLarge(state.max_upload_bytes));
    }

    let image = state
        .objects
        .upload_image(&owner, extension, body.to_vec(), content_type)
        .await
        .map_err(|e| {
            error!(error = %e, "Upload failed");
            ApiError::Internal("upload failed".to_string())
        })?;

    state
        .publisher
        .image_uploaded(image.as_str())
        .await
        .map_err(|e| {
            error!(error = %e, image = %image, "Failed to publish upload event");
            ApiError::Internal("could not queue the upload for cataloguing".to_string())
        })?;

    info!(image = %image, "Upload queued for cataloguing");

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            blob_name: image.blob_name().to_string(),
            url: image.as_str().to_string(),
        }),
    ))
}

#[instrument(skip(state, headers))]
async fn delete_comic(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(comic_id): Path<String>,
) -> Result<(StatusCode, Json<DeleteResponse>), ApiError> {
    let owner = state.owner(&headers)?;
    let comic_id = Uuid::parse_str(&comic_id)
        .map_err(|_| ApiError::BadRequest(format!("invalid comic id {comic_id:?}")))?;

    let request = DeleteRequested::new(comic_id.to_string()).requested_by(owner);
    state.publisher.delete_requested(&request).await.map_err(|e| {
        error!(error = %e, "Failed to publish delete event");
        ApiError::Internal("could not queue the deletion".to_string())
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeleteResponse {
            comic_id,
            status: "deletion_requested",
        }),
    ))
}

/// Start the API server and serve until `shutdown` completes
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
