use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{StreamBroker, StreamMessage, GROUP_PM, TASKS_RESULTS};
use crate::db::Db;
use crate::error::TaskError;
use crate::registry::WorkerRegistry;
use crate::state::TaskStateMachine;
use crate::types::{ResultKind, Task, TaskResult, TaskStatus, WorkerStatus};

/// One logical PM per project: a scheduling loop that feeds ready tasks to
/// the work queue when idle workers exist, and a results loop that consumes
/// worker output and advances the state machine.
pub struct PmOrchestrator {
    project_id: Uuid,
    db: Arc<Db>,
    broker: Arc<dyn StreamBroker>,
    registry: Arc<WorkerRegistry>,
    state: Arc<TaskStateMachine>,
    running: AtomicBool,
    tick_s: u64,
    results_block_ms: u64,
}

impl PmOrchestrator {
    pub fn new(
        project_id: Uuid,
        db: Arc<Db>,
        broker: Arc<dyn StreamBroker>,
        registry: Arc<WorkerRegistry>,
        state: Arc<TaskStateMachine>,
        tick_s: u64,
        results_block_ms: u64,
    ) -> Self {
        Self {
            project_id,
            db,
            broker,
            registry,
            state,
            running: AtomicBool::new(true),
            tick_s,
            results_block_ms,
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Signal both loops to exit after their current iteration. In-flight
    /// work finishes its commit + ack first; consumed-but-unacked messages
    /// stay pending and are redelivered to the next PM.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Promote dependency-free waiting tasks, then run both loops until
    /// `stop()`.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.state.promote_waiting(self.project_id).await {
            warn!("promote waiting tasks for {}: {e}", self.project_id);
        }
        let scheduler = Arc::clone(&self);
        let results = Arc::clone(&self);
        tokio::join!(scheduler.scheduling_loop(), results.results_loop());
        info!("orchestrator for {} stopped", self.project_id);
    }

    // ── Scheduling loop ──────────────────────────────────────────────────

    async fn scheduling_loop(self: Arc<Self>) {
        while self.is_running() {
            if let Err(e) = self.schedule_pass().await {
                error!("scheduling loop error: {e}");
            }
            tokio::time::sleep(std::time::Duration::from_secs(self.tick_s)).await;
        }
    }

    /// Queue ready tasks up to the number of idle workers. Which worker
    /// actually picks a task up is decided by consumer-group semantics;
    /// this pass only avoids over-queueing when nobody is listening.
    pub async fn schedule_pass(&self) -> Result<(), TaskError> {
        let ready = self
            .db
            .list_ready_by_priority(self.project_id)
            .map_err(TaskError::Storage)?;
        let idle_workers = self
            .registry
            .list_all()
            .await
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count();

        for task in ready.into_iter().take(idle_workers) {
            self.state
                .transition(
                    task.id,
                    TaskStatus::Queued,
                    Some("Scheduled by PM"),
                    "pm",
                    None,
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Manually queue the highest-priority ready task.
    pub async fn queue_next(&self) -> Result<Option<Task>, TaskError> {
        let ready = self
            .db
            .list_ready_by_priority(self.project_id)
            .map_err(TaskError::Storage)?;
        let Some(task) = ready.into_iter().next() else {
            return Ok(None);
        };
        let outcome = self
            .state
            .transition(
                task.id,
                TaskStatus::Queued,
                Some("Manually queued"),
                "user",
                None,
                None,
            )
            .await?;
        Ok(Some(outcome.task))
    }

    // ── Results loop ─────────────────────────────────────────────────────

    async fn results_loop(self: Arc<Self>) {
        while self.is_running() {
            let messages = match self
                .broker
                .consume(TASKS_RESULTS, GROUP_PM, "pm-0", 10, self.results_block_ms)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    if self.is_running() {
                        error!("results loop consume error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                    continue;
                }
            };

            for msg in messages {
                match self.process_result(&msg).await {
                    Ok(()) => {
                        if let Err(e) = self.broker.ack(TASKS_RESULTS, GROUP_PM, &msg.id).await {
                            warn!("ack result {}: {e}", msg.id);
                        }
                    }
                    // Leave unacked; the broker redelivers and transition
                    // idempotence makes the retry safe.
                    Err(e) => error!("result processing error: {e}"),
                }
            }
        }
    }

    /// Dispatch one result message. Returns Ok for everything that should
    /// be acked (duplicates, unknown tasks, undecodable payloads included)
    /// and Err only for failures worth a redelivery.
    pub async fn process_result(&self, msg: &StreamMessage) -> Result<(), TaskError> {
        let Some(result) = TaskResult::from_fields(&msg.fields) else {
            warn!("dropping undecodable result message {}", msg.id);
            return Ok(());
        };
        let task = match self.db.get_task(result.task_id).map_err(TaskError::Storage)? {
            Some(task) => task,
            None => {
                warn!("result for unknown task {}", result.task_id);
                return Ok(());
            }
        };

        match result.kind {
            ResultKind::Execution {
                success: true,
                output_path,
                ..
            } => {
                self.assign_reviewer(&task, result.worker_id, output_path.as_deref())
                    .await?;
            }
            ResultKind::Execution {
                success: false,
                error_message,
                ..
            } => {
                let reason = format!(
                    "Execution failed: {}",
                    error_message.unwrap_or_default()
                );
                self.apply(task.id, TaskStatus::Rejected, &reason, None).await?;
                if let Some(worker_id) = result.worker_id {
                    self.registry.set_idle(worker_id).await;
                }
            }
            ResultKind::Qa {
                passed: true,
                feedback,
                ..
            } => {
                let extra = json!({ "qa_result": feedback });
                self.apply(task.id, TaskStatus::Done, "QA passed", Some(&extra))
                    .await?;
                if let Some(worker_id) = result.worker_id {
                    self.registry.set_idle(worker_id).await;
                }
            }
            ResultKind::Qa {
                passed: false,
                feedback,
                ..
            } => {
                let reason = format!("QA failed: {feedback}");
                let extra = json!({ "qa_result": feedback });
                self.apply(task.id, TaskStatus::Rejected, &reason, Some(&extra))
                    .await?;
                if let Some(worker_id) = result.worker_id {
                    self.registry.set_idle(worker_id).await;
                }
            }
        }
        Ok(())
    }

    /// Pick any idle worker other than the executor and route the task to
    /// review. With no eligible reviewer the task stays in_progress and the
    /// next pass retries.
    async fn assign_reviewer(
        &self,
        task: &Task,
        executor_id: Option<Uuid>,
        output_path: Option<&str>,
    ) -> Result<(), TaskError> {
        let workers = self.registry.list_all().await;
        let reviewer = workers
            .into_iter()
            .find(|w| w.status == WorkerStatus::Idle && Some(w.id) != executor_id);

        let Some(reviewer) = reviewer else {
            info!("no eligible reviewer for task {}, leaving in progress", task.id);
            return Ok(());
        };

        let mut extra = json!({ "reviewer_id": reviewer.id.to_string() });
        if let (Some(obj), Some(path)) = (extra.as_object_mut(), output_path) {
            obj.insert("output_path".to_string(), json!(path));
        }
        self.apply(task.id, TaskStatus::Review, "Assigned reviewer", Some(&extra))
            .await?;
        self.registry.set_busy(reviewer.id, task.id).await;
        Ok(())
    }

    /// Run a PM-actor transition, treating a transition-table refusal as an
    /// already-processed duplicate.
    async fn apply(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        reason: &str,
        extra: Option<&serde_json::Value>,
    ) -> Result<(), TaskError> {
        match self
            .state
            .transition(task_id, to, Some(reason), "pm", extra, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(TaskError::InvalidTransition { from, to }) => {
                info!("duplicate result for task {task_id} ({from} -> {to}), ignoring");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────

struct SupervisedPm {
    orchestrator: Arc<PmOrchestrator>,
    handle: JoinHandle<()>,
}

/// Owns the per-project orchestrator map. The supervisor is the only
/// mutator; handlers go through it to start, pause and inspect PMs.
#[derive(Default)]
pub struct Supervisor {
    entries: Mutex<HashMap<Uuid, SupervisedPm>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the orchestrator's loops. Returns false when one is already
    /// running for the project.
    pub async fn start(&self, orchestrator: Arc<PmOrchestrator>) -> bool {
        let mut entries = self.entries.lock().await;
        let project_id = orchestrator.project_id();
        if let Some(existing) = entries.get(&project_id) {
            if existing.orchestrator.is_running() && !existing.handle.is_finished() {
                return false;
            }
        }
        let handle = tokio::spawn(Arc::clone(&orchestrator).run());
        entries.insert(project_id, SupervisedPm { orchestrator, handle });
        true
    }

    /// Flag the project's orchestrator to stop. Returns false when none is
    /// running.
    pub async fn pause(&self, project_id: Uuid) -> bool {
        let entries = self.entries.lock().await;
        match entries.get(&project_id) {
            Some(entry) if entry.orchestrator.is_running() => {
                entry.orchestrator.stop();
                true
            }
            _ => false,
        }
    }

    pub async fn is_running(&self, project_id: Uuid) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(&project_id)
            .map(|e| e.orchestrator.is_running() && !e.handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop every orchestrator (server shutdown).
    pub async fn stop_all(&self) {
        let entries = self.entries.lock().await;
        for entry in entries.values() {
            entry.orchestrator.stop();
        }
    }
}
