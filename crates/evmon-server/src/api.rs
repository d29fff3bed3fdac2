//! Read-only status API
//!
//! - `GET /health`: database connectivity
//! - `GET /jobs`: scheduler snapshot of every registered job
//! - `GET /jobs/:name`: one job by name

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::db;
use crate::error::ApiError;
use crate::scheduler::{JobScheduler, JobStatus};

#[derive(Clone)]
pub struct ApiState {
    pub db: PgPool,
    pub scheduler: Arc<JobScheduler>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:name", get(get_job))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn health(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    db::health_check(&state.db).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "database": "connected"
        })),
    ))
}

async fn list_jobs(State(state): State<ApiState>) -> Json<Vec<JobStatus>> {
    Json(state.scheduler.snapshot())
}

async fn get_job(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    state
        .scheduler
        .snapshot()
        .into_iter()
        .find(|status| status.name == name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No job named '{}'", name)))
}
