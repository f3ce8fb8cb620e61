//! HTTP request handlers.

use super::AppState;
use crate::db::{ProbeParams, ResetMode, Target};
use crate::jobs::Job;
use crate::scheduler::EngineError;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Targets
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub targets: Vec<Target>,
    #[serde(default)]
    pub params: ProbeParams,
    #[serde(default)]
    pub reset_mode: ResetMode,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub targets: usize,
}

pub async fn handle_init(State(state): State<AppState>, Json(req): Json<InitRequest>) -> impl IntoResponse {
    let targets = state.scheduler.init(req.targets, req.params, req.reset_mode).await;
    Json(InitResponse { targets })
}

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub owner: String,
    pub staged: usize,
    /// Owners with a batch waiting for the next cycle.
    pub pending: Vec<String>,
}

pub async fn handle_stage_targets(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Json(targets): Json<Vec<Target>>,
) -> impl IntoResponse {
    if owner.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Owner is required").into_response();
    }

    let staged = targets.len();
    state.scheduler.stage_targets(&owner, targets).await;
    let pending = state.scheduler.pending_owners().await;
    (StatusCode::ACCEPTED, Json(StageResponse { owner, staged, pending })).into_response()
}

// ============================================================================
// Cycles and records
// ============================================================================

/// Overrides for one cycle; anything missing comes from the processor config.
#[derive(Debug, Default, Deserialize)]
pub struct CycleRequest {
    pub next_run_interval_ms: Option<u64>,
    pub global_timeout_ms: Option<u64>,
    pub max_buffer_ms: Option<u64>,
    pub persist: Option<bool>,
}

pub async fn handle_run_cycle(State(state): State<AppState>, Json(req): Json<CycleRequest>) -> impl IntoResponse {
    let mut cfg = state.config.cycle_config();
    if let Some(v) = req.next_run_interval_ms {
        cfg.next_run_interval_ms = v;
    }
    if let Some(v) = req.global_timeout_ms {
        cfg.global_timeout_ms = v;
    }
    if let Some(v) = req.max_buffer_ms {
        cfg.max_buffer_ms = v;
    }
    if let Some(v) = req.persist {
        cfg.persist = v;
    }

    Json(state.scheduler.run_cycle(&cfg).await)
}

pub async fn handle_get_records(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.records().await)
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertIdsRequest {
    pub ids: Vec<i64>,
    pub value: bool,
}

#[derive(Debug, Serialize)]
pub struct UpdatedResponse {
    pub updated: usize,
}

pub async fn handle_set_alert_flag(
    State(state): State<AppState>,
    Json(req): Json<AlertIdsRequest>,
) -> impl IntoResponse {
    let updated = state.scheduler.set_alert_flag(&req.ids, req.value).await;
    Json(UpdatedResponse { updated })
}

pub async fn handle_set_alert_sent(
    State(state): State<AppState>,
    Json(req): Json<AlertIdsRequest>,
) -> impl IntoResponse {
    let updated = state.scheduler.set_alert_sent(&req.ids, req.value).await;
    Json(UpdatedResponse { updated })
}

pub async fn handle_reset_alert(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.scheduler.reset_alert(id).await {
        Ok(before) => Json(before).into_response(),
        Err(EngineError::UnknownRecord(_)) => (StatusCode::NOT_FOUND, "Record not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveSamplesRequest {
    pub sample_ids: Vec<u64>,
}

pub async fn handle_remove_samples(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<RemoveSamplesRequest>,
) -> impl IntoResponse {
    Json(state.scheduler.remove_samples(id, &req.sample_ids).await)
}

// ============================================================================
// Jobs
// ============================================================================

pub async fn handle_submit_job(State(state): State<AppState>, Json(job): Json<Job>) -> impl IntoResponse {
    if job.message_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "message_id is required").into_response();
    }

    let handle = state.jobs.submit(job).await;
    tracing::debug!("Waiting on job {}", handle.message_id());
    Json(handle.wait().await).into_response()
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub message_id: String,
    pub status: crate::jobs::JobStatus,
}

pub async fn handle_job_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.jobs.status(&id).await {
        Some(status) => Json(JobStatusResponse { message_id: id, status }).into_response(),
        None => (StatusCode::NOT_FOUND, "Job not found").into_response(),
    }
}

pub async fn handle_cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.jobs.cancel(&id).await {
        StatusCode::ACCEPTED.into_response()
    } else {
        (StatusCode::NOT_FOUND, "Job not found").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessorConfig;
    use crate::db::{ProbeKind, Store};
    use crate::jobs::{JobQueue, JobSettings, SystemToolFactory, ToolKind};
    use crate::probe::NetworkConnectorFactory;
    use crate::publish::ChannelPublisher;
    use crate::scheduler::ProbeScheduler;
    use axum::response::Response;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn app_state(db: &NamedTempFile) -> AppState {
        app_state_with(db, SystemToolFactory::default())
    }

    fn app_state_with(db: &NamedTempFile, tools: SystemToolFactory) -> AppState {
        let store = Arc::new(Store::new(db.path()).unwrap());
        let (publisher, rx) = ChannelPublisher::new(64);
        tokio::spawn(crate::publish::run_publication_logger(rx));
        let publisher = Arc::new(publisher);

        AppState {
            config: ProcessorConfig::default(),
            scheduler: Arc::new(ProbeScheduler::new(Arc::new(NetworkConnectorFactory), publisher.clone(), store)),
            jobs: Arc::new(JobQueue::new(JobSettings::default(), Arc::new(tools), publisher)),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_init_then_records() {
        let db = NamedTempFile::new().unwrap();
        let state = app_state(&db);

        let req = InitRequest {
            targets: vec![Target {
                owner_id: "u1".to_string(),
                address: "10.0.0.1".to_string(),
                kind: ProbeKind::Tcp,
                ..Default::default()
            }],
            params: ProbeParams::default(),
            reset_mode: ResetMode::Clear,
        };
        let response = handle_init(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["targets"], 1);

        let response = handle_get_records(State(state)).await.into_response();
        let records = body_json(response).await;
        assert_eq!(records[0]["id"], 1);
        assert_eq!(records[0]["address"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_reset_unknown_alert_is_404() {
        let db = NamedTempFile::new().unwrap();
        let state = app_state(&db);
        let response = handle_reset_alert(State(state), Path(42)).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stage_targets_accepted() {
        let db = NamedTempFile::new().unwrap();
        let state = app_state(&db);
        let response = handle_stage_targets(State(state.clone()), Path("u1".to_string()), Json(Vec::new()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["pending"][0], "u1");
    }

    #[tokio::test]
    async fn test_job_endpoints() {
        let db = NamedTempFile::new().unwrap();
        let state = app_state_with(&db, SystemToolFactory::new(vec!["echo".to_string()]));
        state.jobs.start().await;

        let job = Job {
            message_id: "echo-1".to_string(),
            tool: ToolKind::Exec,
            args: vec!["echo".to_string(), "hi".to_string()],
            calling_service: "ui".to_string(),
            page: None,
            line_limit: None,
        };
        let response = handle_submit_job(State(state.clone()), Json(job)).await.into_response();
        let result = body_json(response).await;
        assert_eq!(result["status"], "succeeded");
        assert_eq!(result["output"], "hi\n");

        let response = handle_job_status(State(state.clone()), Path("echo-1".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_cancel_job(State(state), Path("nope".to_string())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_exec_job_refused_by_default() {
        let db = NamedTempFile::new().unwrap();
        let state = app_state(&db);
        state.jobs.start().await;

        let job = Job {
            message_id: "shell-1".to_string(),
            tool: ToolKind::Exec,
            args: vec!["sh".to_string(), "-c".to_string(), "id".to_string()],
            calling_service: "ui".to_string(),
            page: None,
            line_limit: None,
        };
        let response = handle_submit_job(State(state), Json(job)).await.into_response();
        let result = body_json(response).await;
        assert_eq!(result["status"], "failed");
        assert_eq!(result["output"], "");
    }

    #[tokio::test]
    async fn test_submit_job_requires_id() {
        let db = NamedTempFile::new().unwrap();
        let state = app_state(&db);
        let job = Job {
            message_id: " ".to_string(),
            tool: ToolKind::Nmap,
            args: Vec::new(),
            calling_service: String::new(),
            page: None,
            line_limit: None,
        };
        let response = handle_submit_job(State(state), Json(job)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
