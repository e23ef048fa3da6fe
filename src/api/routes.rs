//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::error::ApiError;
use super::state::AppState;
use crate::checks::manual::ManualValidation;
use crate::pipeline::qc::{self, blocking};
use crate::pipeline::RunResponse;
use crate::release::{
    Action, Actor, Attestations, Decision, NewVersion, Permission, VersionStatus,
};
use crate::storage;
use crate::summary::Summary;

/// Identity of the caller, set by the fronting application.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
/// Comma-separated permissions of the caller.
pub const ACTOR_PERMISSIONS_HEADER: &str = "x-actor-permissions";

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/run", post(submit_run))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}/summary", get(run_summary))
        .route("/versions", get(list_versions).post(create_version))
        .route("/versions/{id}", get(get_version))
        .route("/versions/{id}/attestations", put(set_attestations))
        .route("/versions/{id}/submit", post(submit_version))
        .route("/versions/{id}/start-qc", post(start_qc))
        .route("/versions/{id}/run-qc", post(run_qc))
        .route("/versions/{id}/qc-decision", post(qc_decision))
        .route("/versions/{id}/qc-report", get(latest_report))
        .route("/versions/{id}/manual-validation", post(manual_validation))
        .route("/versions/{id}/approve", post(approve))
        .route("/versions/{id}/publish", post(publish))
        .route("/versions/{id}/archive", post(archive))
        .route("/versions/{id}/republish", post(republish))
        .route("/versions/{id}/audit", get(audit))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn actor(headers: &HeaderMap) -> Actor {
    let id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous");
    let permissions = headers
        .get(ACTOR_PERMISSIONS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .filter_map(|p| p.parse::<Permission>().ok())
                .collect()
        })
        .unwrap_or_default();
    Actor::new(id, permissions)
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    required_body(body)
}

fn required_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn data<T: serde::Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunBody {
    #[serde(default)]
    game_url: Option<String>,
    #[serde(default)]
    meta: Option<Value>,
}

async fn submit_run(State(state): State<AppState>, body: Bytes) -> Result<Json<RunResponse>, ApiError> {
    let body: RunBody = optional_body(&body)?;
    let response = state
        .pipeline
        .submit(body.game_url.as_deref(), body.meta.unwrap_or(Value::Null))
        .await??;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let pool = state.pool.clone();
    let runs = tokio::task::spawn_blocking(move || storage::runs::list_runs(&pool, limit))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

fn is_run_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

async fn run_summary(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Summary>, ApiError> {
    if !is_run_id(&run_id) {
        return Err(ApiError::NotFound(format!("run {run_id}")));
    }
    let pool = state.pool.clone();
    let id = run_id.clone();
    let stored = tokio::task::spawn_blocking(move || storage::runs::load_summary(&pool, &id))
        .await
        .map_err(anyhow::Error::from)??;
    if let Some(summary) = stored {
        return Ok(Json(summary));
    }

    // Runs that finished before persistence was configured still have a file.
    let dir = state.pipeline.run_dir(&run_id);
    if Summary::path_in(&dir).is_file() {
        return Ok(Json(Summary::read_from(&dir)?));
    }
    Err(ApiError::NotFound(format!("run {run_id}")))
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TransitionBody {
    attestations: Option<Attestations>,
    expected_status: Option<VersionStatus>,
    evidence_ref: Option<String>,
}

async fn transition(
    state: &AppState,
    id: String,
    action: Action,
    headers: &HeaderMap,
    body: TransitionBody,
) -> Result<Json<Value>, ApiError> {
    let actor = actor(headers);
    let t = blocking(&state.releases, move |s| {
        s.apply(
            &id,
            action,
            &actor,
            body.evidence_ref.as_deref(),
            body.expected_status,
        )
    })
    .await?;
    Ok(data(t))
}

async fn list_versions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let versions = blocking(&state.releases, move |s| s.list(limit)).await?;
    Ok(Json(json!({ "data": versions, "meta": { "total": versions.len() } })))
}

async fn create_version(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let new: NewVersion = required_body(&body)?;
    // Same allow-list as POST /run; QC runs this build later.
    state.pipeline.validate(Some(new.game_url.as_str()))?;
    let version = blocking(&state.releases, move |s| s.create(&new)).await?;
    Ok((StatusCode::CREATED, data(version)))
}

async fn get_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let version = blocking(&state.releases, move |s| s.get(&id)).await?;
    Ok(data(version))
}

async fn set_attestations(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let attestations: Attestations = required_body(&body)?;
    let version = blocking(&state.releases, move |s| s.set_attestations(&id, attestations)).await?;
    Ok(data(version))
}

async fn submit_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mut body: TransitionBody = optional_body(&body)?;
    if let Some(attestations) = body.attestations.take() {
        let target = id.clone();
        blocking(&state.releases, move |s| {
            let version = s.get(&target)?;
            // Attestations only change while the version is editable.
            if matches!(version.status, VersionStatus::Draft | VersionStatus::QcFailed) {
                s.set_attestations(&target, attestations)?;
            }
            Ok(())
        })
        .await?;
    }
    transition(&state, id, Action::SubmitToQc, &headers, body).await
}

async fn start_qc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: TransitionBody = optional_body(&body)?;
    transition(&state, id, Action::StartQc, &headers, body).await
}

/// Move to `qc_processing` and run QC in the background. Retrying while the
/// version is already processing does not start a second run.
async fn run_qc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let actor = actor(&headers);
    let t = qc::start_qc(&state.releases, &id, &actor).await?;

    if t.changed {
        let pipeline = state.pipeline.clone();
        let releases = state.releases.clone();
        let version_id = id.clone();
        tokio::spawn(async move {
            match qc::complete_qc(&pipeline, &releases, &version_id).await {
                Ok(done) => info!(
                    version_id = %version_id,
                    status = %done.version.status,
                    "QC finished"
                ),
                Err(e) => error!(version_id = %version_id, error = %e, "QC did not complete"),
            }
        });
    }
    Ok((StatusCode::ACCEPTED, data(t)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    decision: Decision,
    #[serde(default)]
    expected_status: Option<VersionStatus>,
    #[serde(default)]
    evidence_ref: Option<String>,
}

async fn qc_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: DecisionBody = required_body(&body)?;
    let rest = TransitionBody {
        attestations: None,
        expected_status: body.expected_status,
        evidence_ref: body.evidence_ref,
    };
    transition(&state, id, Action::RecordDecision(body.decision), &headers, rest).await
}

async fn latest_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let version_id = id.clone();
    let report = blocking(&state.releases, move |s| s.latest_report(&version_id)).await?;
    match report {
        Some(r) => Ok(data(r)),
        None => Err(ApiError::NotFound(format!("QC report for version {id}"))),
    }
}

async fn manual_validation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let manual: ManualValidation = required_body(&body)?;
    let report = qc::record_manual_validation(&state.releases, &id, manual).await?;
    Ok((StatusCode::CREATED, data(report)))
}

macro_rules! permissioned {
    ($name:ident, $action:expr) => {
        async fn $name(
            State(state): State<AppState>,
            Path(id): Path<String>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Result<Json<Value>, ApiError> {
            let body: TransitionBody = optional_body(&body)?;
            transition(&state, id, $action, &headers, body).await
        }
    };
}

permissioned!(approve, Action::Approve);
permissioned!(publish, Action::Publish);
permissioned!(archive, Action::Archive);
permissioned!(republish, Action::Republish);

async fn audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let history = blocking(&state.releases, move |s| s.history(&id)).await?;
    Ok(Json(json!({ "data": history, "meta": { "total": history.len() } })))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
