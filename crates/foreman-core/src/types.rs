use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Status Enums ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Design,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
}

/// The eight task states. `Rejected` is recoverable (back to `Ready`);
/// `Done` is the happy-path terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Ready,
    Queued,
    InProgress,
    Review,
    Done,
    Rejected,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "ready" => Some(Self::Ready),
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "review" => Some(Self::Review),
            "done" => Some(Self::Done),
            "rejected" => Some(Self::Rejected),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Allowed target states from this state. Anything not listed is refused.
    pub fn allowed_transitions(self) -> &'static [TaskStatus] {
        match self {
            Self::Waiting => &[Self::Ready, Self::Blocked],
            Self::Ready => &[Self::Queued],
            Self::Queued => &[Self::InProgress],
            Self::InProgress => &[Self::Review, Self::Rejected],
            Self::Review => &[Self::Done, Self::Rejected],
            Self::Done => &[Self::Rejected],
            Self::Rejected => &[Self::Ready],
            Self::Blocked => &[Self::Ready],
        }
    }

    pub fn can_transition(self, to: TaskStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Scheduling rank, critical first.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

// ── Persistent Records ───────────────────────────────────────────────────

/// Root of the work tree, produced by the design-finalize flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Repository the git collaborator operates on (empty = VCS disabled).
    pub repo_path: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ordered sibling under a project; each phase owns a git branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub branch_name: String,
    pub order_index: i64,
    pub status: PhaseStatus,
    pub created_at: DateTime<Utc>,
}

/// The unit of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub phase_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Instruction payload handed to the executing worker.
    pub worker_prompt: Option<String>,
    /// Instruction payload handed to the reviewer.
    pub qa_prompt: Option<String>,
    /// Ids of tasks that must reach `done` before this one is runnable.
    pub depends_on: Vec<Uuid>,
    pub branch_name: Option<String>,
    /// Set when the task completed and a commit was recorded; cleared on
    /// reject-with-revert.
    pub commit_hash: Option<String>,
    pub worker_id: Option<Uuid>,
    pub reviewer_id: Option<Uuid>,
    pub qa_result: Option<String>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    /// Optimistic-locking counter; strictly increases on every mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only ledger row; exactly one per observed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistory {
    pub id: i64,
    pub task_id: Uuid,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    /// Principal that caused the transition ("user", "system", "pm", worker id).
    pub actor: String,
    pub reason: Option<String>,
    pub extra: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Admin-minted token gating worker registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub id: Uuid,
    pub token: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

// ── Ephemeral Records ────────────────────────────────────────────────────

/// A worker as seen by the registry. Never persisted with tasks: presence
/// is TTL-based and disappears when heartbeats stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub name: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    pub executor_type: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<Uuid>,
}

// ── Inputs ───────────────────────────────────────────────────────────────

/// Creation input for a task. Initial status is derived: `waiting` when
/// `depends_on` is non-empty, else `ready`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub project_id: Uuid,
    pub phase_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub worker_prompt: Option<String>,
    #[serde(default)]
    pub qa_prompt: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
}

/// Field updates allowed while a task is still `waiting` or `ready`.
/// Deserialized straight from client requests: only descriptive fields
/// belong here. Assignment and lifecycle state (worker_id, reviewer_id,
/// status, timestamps) must go through the state machine, which
/// re-validates them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFieldUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub worker_prompt: Option<String>,
    pub qa_prompt: Option<String>,
    pub expected_version: Option<i64>,
}

// ── Transition Output ────────────────────────────────────────────────────

/// One dependent re-classified by a cascade (promote on done, block on
/// rejected). Carried out of the transition so board events can be emitted
/// after commit.
#[derive(Debug, Clone)]
pub struct CascadedTransition {
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
}

/// Result of a committed state transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub task: Task,
    pub from: TaskStatus,
    pub cascades: Vec<CascadedTransition>,
}

// ── Stream Payloads ──────────────────────────────────────────────────────

/// A result message published by a worker on `tasks:results`.
///
/// Wire form is the flat string map of the broker; this is the typed view
/// the PM dispatches on.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub kind: ResultKind,
}

#[derive(Debug, Clone)]
pub enum ResultKind {
    Execution {
        success: bool,
        output_path: Option<String>,
        error_message: Option<String>,
    },
    Qa {
        passed: bool,
        feedback: String,
        error_message: Option<String>,
    },
}

impl TaskResult {
    /// Decode a result from broker fields. Returns None when `task_id` is
    /// missing or malformed; such messages are logged and acked by the PM.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let task_id = Uuid::parse_str(fields.get("task_id")?.as_str()).ok()?;
        let worker_id = fields
            .get("worker_id")
            .and_then(|w| Uuid::parse_str(w).ok());
        let kind = match fields.get("type").map(String::as_str) {
            Some("qa") => ResultKind::Qa {
                passed: fields.get("passed").map(String::as_str) == Some("true"),
                feedback: fields.get("feedback").cloned().unwrap_or_default(),
                error_message: fields.get("error_message").filter(|s| !s.is_empty()).cloned(),
            },
            _ => ResultKind::Execution {
                success: fields.get("success").map(String::as_str) == Some("true"),
                output_path: fields.get("output_path").filter(|s| !s.is_empty()).cloned(),
                error_message: fields.get("error_message").filter(|s| !s.is_empty()).cloned(),
            },
        };
        Some(Self { task_id, worker_id, kind })
    }
}
