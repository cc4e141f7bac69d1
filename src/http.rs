//! Thin HTTP surface. Every handler delegates straight to `db`,
//! `dispatcher`, or `telemetry` — no business logic lives here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::db;
use crate::dispatcher::DispatcherHandle;
use crate::models::{JobCreate, PrinterCreate};
use crate::telemetry::PrinterManager;

#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub printers: Arc<PrinterManager>,
    pub dispatcher: Arc<DispatcherHandle>,
    pub uploads_dir: std::path::PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/printers", get(list_printers).post(create_printer))
        .route("/api/v1/printers/:id", delete(delete_printer))
        .route("/api/v1/jobs", get(list_jobs).post(create_job))
        .route("/api/v1/jobs/:id", delete(delete_job))
        .route("/api/v1/jobs/:id/priority", patch(set_priority))
        .route("/api/v1/jobs/:id/retry", post(retry_job))
        .route("/api/v1/status", get(status))
        .route("/api/v1/control/pause", post(pause))
        .route("/api/v1/control/resume", post(resume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type Reply<T> = Result<Json<T>, (StatusCode, Json<serde_json::Value>)>;

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    log::error!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": err.to_string()})),
    )
}

fn not_found(what: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": format!("{what} not found")})))
}

async fn list_printers(State(state): State<AppState>) -> Reply<Vec<crate::models::Printer>> {
    let printers = db::list_printers(&state.pool).await.map_err(internal_error)?;
    Ok(Json(printers))
}

async fn create_printer(
    State(state): State<AppState>,
    Json(payload): Json<PrinterCreate>,
) -> Reply<crate::models::Printer> {
    let printer = db::create_printer(&state.pool, payload)
        .await
        .map_err(internal_error)?;
    state
        .printers
        .add_printer(&printer.serial, &printer.host_address, &printer.access_code)
        .await;
    Ok(Json(printer))
}

async fn delete_printer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let Some(printer) = db::get_printer(&state.pool, id).await.map_err(internal_error)? else {
        return Err(not_found("printer"));
    };

    // Eager teardown of the Telemetry Client session, per the Open
    // Question resolution recorded in DESIGN.md.
    state.printers.remove_printer(&printer.serial).await;

    let deleted = db::delete_printer(&state.pool, id).await.map_err(internal_error)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("printer"))
    }
}

async fn list_jobs(State(state): State<AppState>) -> Reply<Vec<crate::models::Job>> {
    let jobs = db::list_jobs(&state.pool).await.map_err(internal_error)?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<JobCreate>,
) -> Reply<crate::models::Job> {
    let job = db::create_job(&state.pool, payload).await.map_err(internal_error)?;
    Ok(Json(job))
}

/// Deletes a job. Per the "Shared-file lifetime" design note, the stored
/// archive (and thumbnail) are only removed from disk when no other job
/// still references the same path — this handler performs that gating
/// check; actual disk removal is left to the caller's storage contract.
async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let Some(job) = db::get_job(&state.pool, id).await.map_err(internal_error)? else {
        return Err(not_found("job"));
    };

    let deleted = db::delete_job(&state.pool, id).await.map_err(internal_error)?;
    if !deleted {
        return Err(not_found("job"));
    }

    let still_referenced = !db::jobs_referencing_path(&state.pool, &job.stored_path, id)
        .await
        .map_err(internal_error)?
        .is_empty();

    if !still_referenced {
        let local_path = state.uploads_dir.join(&job.stored_path);
        if let Err(err) = tokio::fs::remove_file(&local_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove orphaned archive {}: {err}", local_path.display());
            }
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PriorityUpdate {
    priority: i64,
}

async fn set_priority(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<PriorityUpdate>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let updated = db::set_priority(&state.pool, id, payload.priority)
        .await
        .map_err(internal_error)?;
    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("job"))
    }
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    let retried = db::retry_job(&state.pool, id).await.map_err(internal_error)?;
    if retried {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("job (or not in a retryable state)"))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    paused: bool,
    printers: std::collections::HashMap<String, crate::state::StateSnapshot>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        paused: state.dispatcher.is_paused(),
        printers: state.printers.snapshot_all().await,
    })
}

async fn pause(State(state): State<AppState>) -> StatusCode {
    state.dispatcher.set_paused(true);
    StatusCode::NO_CONTENT
}

async fn resume(State(state): State<AppState>) -> StatusCode {
    state.dispatcher.set_paused(false);
    StatusCode::NO_CONTENT
}
