use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
};
use chrono::{Duration, Utc};
use foreman_core::{
    broker::{
        StreamMessage, EVENTS_BOARD, GROUP_REVIEWERS, GROUP_WORKERS, TASKS_QA, TASKS_QUEUE,
        TASKS_RESULTS,
    },
    error::TaskError,
    orchestrator::PmOrchestrator,
    types::{
        NewTask, ProjectStatus, TaskFieldUpdate, TaskPriority, TaskStatus, WorkerStatus,
    },
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "internal error" })),
    )
}

fn task_error(e: TaskError) -> ApiError {
    let status = match &e {
        TaskError::InvalidTransition { .. }
        | TaskError::ReviewerIsExecutor { .. }
        | TaskError::DependencyNotFound(_)
        | TaskError::CircularDependency
        | TaskError::NotUpdatable => StatusCode::BAD_REQUEST,
        TaskError::NotFound => StatusCode::NOT_FOUND,
        TaskError::VersionConflict { .. } => StatusCode::CONFLICT,
        TaskError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        return internal(e);
    }
    (status, Json(json!({ "detail": e.to_string() })))
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "detail": format!("{what} not found") })),
    )
}

// ── Worker auth ───────────────────────────────────────────────────────────

/// Validate `Authorization: Bearer {token}` and return the worker id.
async fn verify_worker_token(state: &AppState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(token) = auth.strip_prefix("Bearer ") else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "Missing or invalid token" })),
        ));
    };
    state.registry.resolve_token(token).await.ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "Invalid token" })),
    ))
}

// ── Request bodies ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct CreateProjectBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub repo_path: String,
}

#[derive(Deserialize)]
pub(crate) struct CreatePhaseBody {
    pub name: String,
    pub description: Option<String>,
    pub order: i64,
    pub branch_name: Option<String>,
}

/// The one request body (with TaskFieldUpdate) where a client can inject
/// task state the in-process scheduler would otherwise derive itself.
/// worker_id / reviewer_id pass through untrusted; the repository
/// re-validates them inside the transition transaction, and any new
/// endpoint taking assignment ids must do the same rather than trust the
/// caller.
#[derive(Deserialize)]
pub(crate) struct TransitionBody {
    pub new_status: TaskStatus,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub expected_version: Option<i64>,
    pub worker_id: Option<Uuid>,
    pub reviewer_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub(crate) struct RegisterWorkerBody {
    pub name: Option<String>,
    pub platform: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_executor_type")]
    pub executor_type: String,
    #[serde(default)]
    pub registration_token: String,
}

fn default_executor_type() -> String {
    "claude-code".to_string()
}

#[derive(Deserialize)]
pub(crate) struct ConsumeBody {
    pub group: String,
    pub consumer: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
}

fn default_count() -> usize {
    1
}

fn default_block_ms() -> u64 {
    30_000
}

#[derive(Deserialize)]
pub(crate) struct PublishBody {
    pub fields: HashMap<String, String>,
}

#[derive(Deserialize)]
pub(crate) struct AckBody {
    pub group: String,
    pub message_id: String,
}

#[derive(Deserialize)]
pub(crate) struct MintTokenBody {
    pub name: String,
    pub expires_in_s: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct GetTaskQuery {
    #[serde(default)]
    pub include_history: bool,
}

#[derive(Deserialize)]
pub(crate) struct ListTasksQuery {
    pub status: Option<String>,
    pub phase_id: Option<Uuid>,
    pub priority: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

// ── Projects / phases ─────────────────────────────────────────────────────

pub(crate) async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let project = state
        .db
        .insert_project(&body.name, &body.description, &body.repo_path)
        .map_err(internal)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(project).map_err(internal)?),
    ))
}

pub(crate) async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let projects = state.db.list_projects().map_err(internal)?;
    Ok(Json(serde_json::to_value(projects).map_err(internal)?))
}

fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

pub(crate) async fn create_phase(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreatePhaseBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.db.get_project(project_id).map_err(internal)?.is_none() {
        return Err(not_found("Project"));
    }

    let branch_name = body
        .branch_name
        .unwrap_or_else(|| format!("phase-{}-{}", body.order, slugify(&body.name)));

    let phase = state
        .db
        .insert_phase(
            project_id,
            &body.name,
            body.description.as_deref(),
            &branch_name,
            body.order,
        )
        .map_err(internal)?;

    // Branch creation is best-effort; the phase exists either way.
    if let Some(ref git) = state.git {
        if let Err(e) = git.create_branch(&branch_name) {
            tracing::warn!("create branch {branch_name}: {e}");
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(phase).map_err(internal)?),
    ))
}

pub(crate) async fn list_phases(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let phases = state.db.list_phases(project_id).map_err(internal)?;
    Ok(Json(serde_json::to_value(phases).map_err(internal)?))
}

// ── Tasks ─────────────────────────────────────────────────────────────────

pub(crate) async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTask>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task = state.db.create_task(&body).map_err(task_error)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(task).map_err(internal)?),
    ))
}

pub(crate) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetTaskQuery>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .db
        .get_task(id)
        .map_err(internal)?
        .ok_or_else(|| not_found("Task"))?;

    let mut value = serde_json::to_value(&task).map_err(internal)?;
    if query.include_history {
        let history = state.db.list_history(id).map_err(internal)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "history".to_string(),
                serde_json::to_value(history).map_err(internal)?,
            );
        }
    }
    Ok(Json(value))
}

pub(crate) async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TaskFieldUpdate>,
) -> Result<Json<Value>, ApiError> {
    let task = state.db.update_task_fields(id, &body).map_err(task_error)?;
    Ok(Json(serde_json::to_value(task).map_err(internal)?))
}

pub(crate) async fn transition_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<TransitionBody>,
) -> Result<Json<Value>, ApiError> {
    let actor = body.actor.unwrap_or_else(|| "user".to_string());

    let mut extra = serde_json::Map::new();
    if let Some(worker_id) = body.worker_id {
        extra.insert("worker_id".into(), json!(worker_id.to_string()));
    }
    if let Some(reviewer_id) = body.reviewer_id {
        extra.insert("reviewer_id".into(), json!(reviewer_id.to_string()));
    }
    let extra = if extra.is_empty() {
        None
    } else {
        Some(Value::Object(extra))
    };

    let outcome = state
        .state_machine
        .transition(
            id,
            body.new_status,
            body.reason.as_deref(),
            &actor,
            extra.as_ref(),
            body.expected_version,
        )
        .await
        .map_err(task_error)?;

    Ok(Json(json!({
        "task_id": outcome.task.id,
        "status": outcome.task.status,
        "previous_status": outcome.from,
        "transition": {
            "from": outcome.from,
            "to": outcome.task.status,
            "reason": body.reason,
            "actor": actor,
        },
    })))
}

pub(crate) async fn list_project_tasks(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(TaskStatus::parse(s).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": format!("unknown status {s:?}") })),
            )
        })?),
        None => None,
    };
    let priority = match query.priority.as_deref() {
        Some(p) => Some(TaskPriority::parse(p).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": format!("unknown priority {p:?}") })),
            )
        })?),
        None => None,
    };

    let tasks = state
        .db
        .list_by_project(
            project_id,
            status,
            query.phase_id,
            priority,
            query.limit.unwrap_or(50).min(200),
            query.offset.unwrap_or(0).max(0),
        )
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(tasks).map_err(internal)?))
}

// ── Workers ───────────────────────────────────────────────────────────────

pub(crate) async fn register_worker(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterWorkerBody>,
) -> Result<Json<Value>, ApiError> {
    let valid = state
        .db
        .registration_token_valid(&body.registration_token)
        .map_err(internal)?;
    if !valid {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "detail": "Invalid registration token" })),
        ));
    }

    // Auto-generated display name when the worker did not pick one.
    let name = match body.name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
    };
    let (record, token) = state
        .registry
        .register(
            &name,
            &body.platform,
            body.capabilities,
            &body.executor_type,
        )
        .await;
    tracing::info!("registered worker {} ({name})", record.id);

    Ok(Json(json!({
        "worker_id": record.id,
        "token": token,
        "name": name,
        "heartbeat_interval": state.config.heartbeat_interval_s,
        "streams": {
            "tasks_queue": TASKS_QUEUE,
            "tasks_results": TASKS_RESULTS,
            "tasks_qa": TASKS_QA,
        },
        "consumer_groups": {
            "workers": GROUP_WORKERS,
            "reviewers": GROUP_REVIEWERS,
        },
    })))
}

pub(crate) async fn heartbeat_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let authenticated = verify_worker_token(&state, &headers).await?;
    if authenticated != worker_id {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "detail": "Token does not match worker" })),
        ));
    }

    if !state.registry.heartbeat(worker_id).await {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "Worker not found or expired" })),
        ));
    }

    let status = state
        .registry
        .get(worker_id)
        .await
        .map(|w| w.status)
        .unwrap_or(WorkerStatus::Idle);

    Ok(Json(json!({
        "status": status,
        "pending_tasks": 0,
    })))
}

pub(crate) async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let workers = state.registry.list_all().await;
    Ok(Json(serde_json::to_value(workers).map_err(internal)?))
}

pub(crate) async fn deregister_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<Uuid>,
) -> Json<Value> {
    state.registry.deregister(worker_id).await;
    Json(json!({ "detail": "Worker deregistered", "worker_id": worker_id }))
}

// ── PM ────────────────────────────────────────────────────────────────────

fn build_orchestrator(state: &Arc<AppState>, project_id: Uuid) -> Arc<PmOrchestrator> {
    Arc::new(PmOrchestrator::new(
        project_id,
        Arc::clone(&state.db),
        Arc::clone(&state.broker),
        Arc::clone(&state.registry),
        Arc::clone(&state.state_machine),
        state.config.scheduler_tick_s,
        state.config.results_block_ms,
    ))
}

pub(crate) async fn pm_start(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if state.db.get_project(project_id).map_err(internal)?.is_none() {
        return Err(not_found("Project"));
    }

    let orchestrator = build_orchestrator(&state, project_id);
    if !state.supervisor.start(orchestrator).await {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "detail": "Orchestrator already running for this project" })),
        ));
    }
    state
        .db
        .set_project_status(project_id, ProjectStatus::Active)
        .map_err(internal)?;

    Ok(Json(json!({
        "detail": "Orchestration started",
        "project_id": project_id,
    })))
}

pub(crate) async fn pm_pause(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if !state.supervisor.pause(project_id).await {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "No running orchestrator for this project" })),
        ));
    }
    state
        .db
        .set_project_status(project_id, ProjectStatus::Paused)
        .map_err(internal)?;
    Ok(Json(json!({
        "detail": "Orchestration paused",
        "project_id": project_id,
    })))
}

pub(crate) async fn pm_status(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let running = state.supervisor.is_running(project_id).await;

    let workers = state.registry.list_all().await;
    let idle = workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Idle)
        .count();
    let busy = workers
        .iter()
        .filter(|w| w.status == WorkerStatus::Busy)
        .count();

    let task_counts = state.db.count_by_status(project_id).map_err(internal)?;

    Ok(Json(json!({
        "project_id": project_id,
        "running": running,
        "workers": {
            "idle": idle,
            "busy": busy,
            "total": workers.len(),
        },
        "tasks": task_counts,
    })))
}

pub(crate) async fn pm_queue_next(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let orchestrator = build_orchestrator(&state, project_id);
    let task = orchestrator
        .queue_next()
        .await
        .map_err(task_error)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "No ready tasks to queue" })),
            )
        })?;

    Ok(Json(json!({
        "detail": "Task queued",
        "task_id": task.id,
        "title": task.title,
        "priority": task.priority,
    })))
}

pub(crate) async fn pm_promote_waiting(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let promoted = state
        .state_machine
        .promote_waiting(project_id)
        .await
        .map_err(task_error)?;

    let summaries: Vec<Value> = promoted
        .iter()
        .map(|t| json!({ "task_id": t.id, "title": t.title }))
        .collect();

    Ok(Json(json!({
        "detail": format!("Promoted {} tasks to ready", summaries.len()),
        "promoted": summaries,
    })))
}

// ── Stream relay ──────────────────────────────────────────────────────────

const RELAY_STREAMS: &[&str] = &[TASKS_QUEUE, TASKS_QA, TASKS_RESULTS, EVENTS_BOARD];

fn check_stream(stream: &str) -> Result<(), ApiError> {
    if RELAY_STREAMS.contains(&stream) {
        Ok(())
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("unknown stream {stream:?}") })),
        ))
    }
}

pub(crate) async fn stream_consume(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ConsumeBody>,
) -> Result<Json<Vec<StreamMessage>>, ApiError> {
    verify_worker_token(&state, &headers).await?;
    check_stream(&stream)?;
    let messages = state
        .broker
        .consume(
            &stream,
            &body.group,
            &body.consumer,
            body.count.clamp(1, 100),
            body.block_ms.min(30_000),
        )
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

pub(crate) async fn stream_publish(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PublishBody>,
) -> Result<Json<Value>, ApiError> {
    verify_worker_token(&state, &headers).await?;
    check_stream(&stream)?;
    let id = state
        .broker
        .publish(&stream, body.fields)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "id": id })))
}

pub(crate) async fn stream_ack(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AckBody>,
) -> Result<Json<Value>, ApiError> {
    verify_worker_token(&state, &headers).await?;
    check_stream(&stream)?;
    state
        .broker
        .ack(&stream, &body.group, &body.message_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "detail": "acknowledged" })))
}

// ── Registration tokens ───────────────────────────────────────────────────

pub(crate) async fn mint_registration_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MintTokenBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let expires_at = body.expires_in_s.map(|s| Utc::now() + Duration::seconds(s));
    let token = state
        .db
        .create_registration_token(&body.name, expires_at)
        .map_err(internal)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(token).map_err(internal)?),
    ))
}

pub(crate) async fn list_registration_tokens(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let tokens = state.db.list_registration_tokens().map_err(internal)?;
    Ok(Json(serde_json::to_value(tokens).map_err(internal)?))
}

pub(crate) async fn revoke_registration_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if !state.db.revoke_registration_token(id).map_err(internal)? {
        return Err(not_found("Registration token"));
    }
    Ok(Json(json!({ "detail": "Registration token revoked", "id": id })))
}
