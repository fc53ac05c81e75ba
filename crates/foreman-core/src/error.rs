use uuid::Uuid;

use crate::types::TaskStatus;

/// Task-layer failures surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict { expected: i64, current: i64 },

    #[error("reviewer must differ from the executing worker ({worker_id})")]
    ReviewerIsExecutor { worker_id: Uuid },

    #[error("dependency tasks not found: {0:?}")]
    DependencyNotFound(Vec<Uuid>),

    #[error("circular dependency detected")]
    CircularDependency,

    #[error("task can only be updated in waiting or ready status")]
    NotUpdatable,

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TaskError {
    /// True for failures the caller caused (4xx-class), false for internals.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

/// Prompt envelope verification failures. All three are treated as
/// execution failures by consumers.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope")]
    Malformed,

    #[error("envelope expired or timestamp in the future")]
    Expired,

    #[error("signature mismatch")]
    SignatureMismatch,
}

/// Git collaborator failure. Swallowed inside state-machine side effects;
/// task progression never depends on VCS availability.
#[derive(Debug, thiserror::Error)]
#[error("git {op} failed: {detail}")]
pub struct VcsError {
    pub op: String,
    pub detail: String,
}

impl VcsError {
    pub fn new(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { op: op.into(), detail: detail.into() }
    }
}
