mod routes;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use foreman_core::{
    broker::{MemoryBroker, StreamBroker, EVENTS_BOARD, TASKS_QA, TASKS_QUEUE, TASKS_RESULTS},
    config::Config,
    db::Db,
    envelope::PromptSigner,
    git::{GitCollaborator, ShellGit},
    orchestrator::Supervisor,
    registry::WorkerRegistry,
    state::TaskStateMachine,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub broker: Arc<dyn StreamBroker>,
    pub registry: Arc<WorkerRegistry>,
    pub state_machine: Arc<TaskStateMachine>,
    pub supervisor: Arc<Supervisor>,
    pub git: Option<Arc<dyn GitCollaborator>>,
    pub start_time: Instant,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "foreman_server=info,foreman_core=info,tower_http=warn".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(Db::open(&config.db_path())?);
    db.migrate()?;

    let broker: Arc<dyn StreamBroker> = Arc::new(MemoryBroker::new(config.claim_timeout_s));
    broker.initialize().await?;

    let registry = Arc::new(WorkerRegistry::new(
        config.worker_ttl_s,
        config.worker_token_ttl_s,
    ));

    let git: Option<Arc<dyn GitCollaborator>> = if config.repo_path.is_empty() {
        None
    } else {
        Some(Arc::new(ShellGit::new(config.repo_path.clone())))
    };

    let mut state_machine =
        TaskStateMachine::new(Arc::clone(&db), Arc::clone(&broker));
    if let Some(ref git) = git {
        state_machine = state_machine.with_git(Arc::clone(git));
    }
    if !config.prompt_secret.is_empty() {
        state_machine = state_machine.with_signer(PromptSigner::new(&config.prompt_secret));
    } else {
        warn!("PROMPT_SECRET not set, prompts travel unsigned");
    }
    let state_machine = Arc::new(state_machine);

    // Periodic stream hygiene: bound work streams tightly, keep a longer
    // board tail for observers.
    {
        let broker = Arc::clone(&broker);
        let trim_interval = config.trim_interval_s;
        let stream_maxlen = config.stream_maxlen;
        let board_maxlen = config.board_maxlen;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(trim_interval)).await;
                for stream in [TASKS_QUEUE, TASKS_QA, TASKS_RESULTS] {
                    if let Err(e) = broker.trim(stream, stream_maxlen).await {
                        warn!("trim {stream}: {e}");
                    }
                }
                if let Err(e) = broker.trim(EVENTS_BOARD, board_maxlen).await {
                    warn!("trim {EVENTS_BOARD}: {e}");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        db,
        config: Arc::clone(&config),
        broker,
        registry,
        state_machine,
        supervisor: Arc::new(Supervisor::new()),
        git,
        start_time: Instant::now(),
    });

    let app = Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Projects / phases
        .route("/api/v1/projects", post(routes::create_project))
        .route("/api/v1/projects", get(routes::list_projects))
        .route("/api/v1/projects/:id/phases", post(routes::create_phase))
        .route("/api/v1/projects/:id/phases", get(routes::list_phases))
        // Tasks
        .route("/api/v1/tasks", post(routes::create_task))
        .route("/api/v1/tasks/:id", get(routes::get_task))
        .route("/api/v1/tasks/:id", patch(routes::update_task))
        .route("/api/v1/tasks/:id/transition", post(routes::transition_task))
        .route(
            "/api/v1/tasks/by-project/:project_id",
            get(routes::list_project_tasks),
        )
        // Workers
        .route("/api/v1/workers/register", post(routes::register_worker))
        .route(
            "/api/v1/workers/:id/heartbeat",
            post(routes::heartbeat_worker),
        )
        .route("/api/v1/workers", get(routes::list_workers))
        .route("/api/v1/workers/:id", delete(routes::deregister_worker))
        // PM
        .route("/api/v1/pm/:project_id/start", post(routes::pm_start))
        .route("/api/v1/pm/:project_id/pause", post(routes::pm_pause))
        .route("/api/v1/pm/:project_id/status", get(routes::pm_status))
        .route("/api/v1/pm/:project_id/queue-next", post(routes::pm_queue_next))
        .route(
            "/api/v1/pm/:project_id/promote-waiting",
            post(routes::pm_promote_waiting),
        )
        // Stream relay for remote workers
        .route("/api/v1/streams/:stream/consume", post(routes::stream_consume))
        .route("/api/v1/streams/:stream/publish", post(routes::stream_publish))
        .route("/api/v1/streams/:stream/ack", post(routes::stream_ack))
        // Registration tokens
        .route(
            "/api/v1/registration-tokens",
            post(routes::mint_registration_token),
        )
        .route(
            "/api/v1/registration-tokens",
            get(routes::list_registration_tokens),
        )
        .route(
            "/api/v1/registration-tokens/:id",
            delete(routes::revoke_registration_token),
        )
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
