use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{StreamBroker, TASKS_QA, TASKS_QUEUE};
use crate::db::Db;
use crate::envelope::PromptSigner;
use crate::error::TaskError;
use crate::git::GitCollaborator;
use crate::types::{Task, TaskStatus, TransitionOutcome};

/// Drives task status transitions.
///
/// The durable part of a transition (history row, status + version bump,
/// dependency cascades) is applied in one repository transaction; queue
/// publishes, board events and git calls run after commit. VCS failures are
/// logged and swallowed; task progression never depends on git
/// availability. Re-issuing a transition that already applied fails the
/// transition-table check, which is what makes at-least-once result
/// delivery safe to ack.
pub struct TaskStateMachine {
    db: Arc<Db>,
    broker: Arc<dyn StreamBroker>,
    git: Option<Arc<dyn GitCollaborator>>,
    signer: Option<PromptSigner>,
}

impl TaskStateMachine {
    pub fn new(db: Arc<Db>, broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            db,
            broker,
            git: None,
            signer: None,
        }
    }

    pub fn with_git(mut self, git: Arc<dyn GitCollaborator>) -> Self {
        self.git = Some(git);
        self
    }

    pub fn with_signer(mut self, signer: PromptSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Execute a state transition with side effects.
    pub async fn transition(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        reason: Option<&str>,
        actor: &str,
        extra: Option<&serde_json::Value>,
        expected_version: Option<i64>,
    ) -> Result<TransitionOutcome, TaskError> {
        let mut outcome =
            self.db
                .apply_transition(task_id, to, reason, actor, extra, expected_version)?;

        match to {
            TaskStatus::Queued => self.publish_work(&outcome.task).await,
            TaskStatus::Review => self.publish_qa(&outcome.task).await,
            TaskStatus::Done => self.commit_task(&mut outcome),
            TaskStatus::Rejected => self.revert_task(&mut outcome),
            _ => {}
        }

        self.publish_board(&outcome.task, outcome.from, to, actor).await;
        for cascade in &outcome.cascades {
            let fields = board_fields(
                cascade.task_id,
                cascade.project_id,
                cascade.from,
                cascade.to,
                "system",
            );
            if let Err(e) = self.broker.publish_board_event("task_transition", fields).await {
                warn!("board event for cascaded task {}: {e}", cascade.task_id);
            }
        }

        Ok(outcome)
    }

    /// Promote waiting tasks whose dependencies are all met to ready.
    /// Used by the orchestrator's startup pass and the manual endpoint.
    pub async fn promote_waiting(&self, project_id: Uuid) -> Result<Vec<Task>, TaskError> {
        let waiting = self
            .db
            .list_by_project(project_id, Some(TaskStatus::Waiting), None, None, 500, 0)
            .map_err(TaskError::Storage)?;

        let mut promoted = Vec::new();
        for task in waiting {
            if !self.db.check_dependencies_met(task.id).map_err(TaskError::Storage)? {
                continue;
            }
            match self
                .transition(
                    task.id,
                    TaskStatus::Ready,
                    Some("All dependencies met"),
                    "system",
                    None,
                    None,
                )
                .await
            {
                Ok(outcome) => promoted.push(outcome.task),
                // A cascade can beat us to it; a stale `waiting` view is
                // not an error.
                Err(TaskError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(promoted)
    }

    pub fn check_dependencies_met(&self, task_id: Uuid) -> Result<bool, TaskError> {
        self.db.check_dependencies_met(task_id).map_err(TaskError::Storage)
    }

    // ── Post-commit side effects ─────────────────────────────────────────

    /// Publish the task to the work queue, attaching a signed worker prompt
    /// when a signer is configured and the task carries one.
    async fn publish_work(&self, task: &Task) {
        let mut fields = HashMap::from([
            ("task_id".to_string(), task.id.to_string()),
            ("project_id".to_string(), task.project_id.to_string()),
            ("priority".to_string(), task.priority.as_str().to_string()),
            ("title".to_string(), task.title.clone()),
        ]);
        match (&self.signer, &task.worker_prompt) {
            (Some(signer), Some(prompt)) => {
                if let Ok(envelope) = serde_json::to_string(&signer.sign(prompt)) {
                    fields.insert("signed_worker_prompt".to_string(), envelope);
                }
            }
            // Unsigned deployments still carry the instruction.
            (None, Some(prompt)) => {
                fields.insert("worker_prompt".to_string(), prompt.clone());
            }
            _ => {}
        }
        if let Err(e) = self.broker.publish(TASKS_QUEUE, fields).await {
            warn!("publish task {} to work queue: {e}", task.id);
        }
    }

    async fn publish_qa(&self, task: &Task) {
        let mut fields = HashMap::from([
            ("task_id".to_string(), task.id.to_string()),
            ("project_id".to_string(), task.project_id.to_string()),
            ("title".to_string(), task.title.clone()),
        ]);
        match (&self.signer, &task.qa_prompt) {
            (Some(signer), Some(prompt)) => {
                if let Ok(envelope) = serde_json::to_string(&signer.sign(prompt)) {
                    fields.insert("signed_qa_prompt".to_string(), envelope);
                }
            }
            (None, Some(prompt)) => {
                fields.insert("qa_prompt".to_string(), prompt.clone());
            }
            _ => {}
        }
        if let Err(e) = self.broker.publish(TASKS_QA, fields).await {
            warn!("publish task {} to qa queue: {e}", task.id);
        }
    }

    /// Commit the completed task's work on its branch and record the hash.
    fn commit_task(&self, outcome: &mut TransitionOutcome) {
        let task = &outcome.task;
        let (Some(git), Some(branch)) = (&self.git, &task.branch_name) else {
            return;
        };
        match git.commit_task(&task.id.to_string(), &task.title, branch) {
            Ok(hash) => {
                if let Err(e) = self.db.set_commit_hash(task.id, Some(&hash)) {
                    warn!("record commit hash for task {}: {e}", task.id);
                    return;
                }
                info!("task {} committed as {hash}", task.id);
                self.refresh(outcome);
            }
            Err(e) => warn!("git commit for task {}: {e}", task.id),
        }
    }

    /// Revert the task's recorded commit and clear the hash.
    fn revert_task(&self, outcome: &mut TransitionOutcome) {
        let task = &outcome.task;
        let (Some(git), Some(hash)) = (&self.git, &task.commit_hash) else {
            return;
        };
        match git.revert(hash) {
            Ok(()) => {
                if let Err(e) = self.db.set_commit_hash(task.id, None) {
                    warn!("clear commit hash for task {}: {e}", task.id);
                    return;
                }
                info!("task {} commit {hash} reverted", task.id);
                self.refresh(outcome);
            }
            Err(e) => warn!("git revert for task {}: {e}", task.id),
        }
    }

    async fn publish_board(&self, task: &Task, from: TaskStatus, to: TaskStatus, actor: &str) {
        let fields = board_fields(task.id, task.project_id, from, to, actor);
        if let Err(e) = self.broker.publish_board_event("task_transition", fields).await {
            warn!("board event for task {}: {e}", task.id);
        }
    }

    fn refresh(&self, outcome: &mut TransitionOutcome) {
        match self.db.get_task(outcome.task.id) {
            Ok(Some(task)) => outcome.task = task,
            Ok(None) => {}
            Err(e) => warn!("reload task {}: {e}", outcome.task.id),
        }
    }
}

fn board_fields(
    task_id: Uuid,
    project_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    actor: &str,
) -> HashMap<String, String> {
    HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("project_id".to_string(), project_id.to_string()),
        ("from_status".to_string(), from.as_str().to_string()),
        ("to_status".to_string(), to.as_str().to_string()),
        ("actor".to_string(), actor.to_string()),
    ])
}
