//! HTTP surface: read-only queries plus per-source status and reset.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::StoreError;
use crate::ingest::{ResetOutcome, SourceStatus, StatusRegistry};
use crate::model::AnalyzedPost;
use crate::query::{Aggregate, PostFilter, QueryService};

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub status: StatusRegistry,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/posts", get(list_posts))
        .route("/aggregate", get(aggregate))
        .route("/sources", get(list_sources))
        .route("/sources/{id}/reset", post(reset_source))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Store failures surface as 503; the query itself was fine.
struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "query failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

async fn list_posts(
    State(state): State<AppState>,
    Query(filter): Query<PostFilter>,
) -> Result<Json<Vec<AnalyzedPost>>, ApiError> {
    Ok(Json(state.query.list(&filter).await?))
}

async fn aggregate(
    State(state): State<AppState>,
    Query(filter): Query<PostFilter>,
) -> Result<Json<Aggregate>, ApiError> {
    Ok(Json(state.query.aggregate(&filter).await?))
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceStatus>> {
    Json(state.status.snapshot())
}

async fn reset_source(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.status.request_reset(&id) {
        ResetOutcome::Accepted => {
            tracing::info!(source = %id, "reset requested");
            (StatusCode::ACCEPTED, Json(json!({ "source_id": id, "reset": "accepted" })))
                .into_response()
        }
        ResetOutcome::NotFailed => (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("source {id} is not failed") })),
        )
            .into_response(),
        ResetOutcome::UnknownSource => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown source {id}") })),
        )
            .into_response(),
    }
}
