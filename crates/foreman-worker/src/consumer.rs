use std::collections::HashMap;
use std::sync::Arc;

use foreman_core::broker::{
    StreamBroker, StreamMessage, GROUP_REVIEWERS, GROUP_WORKERS, TASKS_QA, TASKS_QUEUE,
    TASKS_RESULTS,
};
use foreman_core::envelope::PromptSigner;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::WorkerAgent;
use crate::executor::Executor;

/// Pulls work from the task and QA streams, runs the executor, publishes
/// results and always acks: a crash before the publish leaves the message
/// pending for another consumer, a crash after it at worst produces a
/// duplicate result that the PM discards as an invalid transition.
pub struct TaskConsumer {
    broker: Arc<dyn StreamBroker>,
    agent: Arc<WorkerAgent>,
    executor: Arc<dyn Executor>,
    verifier: Option<PromptSigner>,
}

impl TaskConsumer {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        agent: Arc<WorkerAgent>,
        executor: Arc<dyn Executor>,
        verifier: Option<PromptSigner>,
    ) -> Self {
        Self {
            broker,
            agent,
            executor,
            verifier,
        }
    }

    /// Consume coding tasks from `tasks:queue`.
    pub async fn task_loop(self: Arc<Self>) {
        while self.agent.is_running() {
            let Some(worker_id) = self.agent.worker_id().await else {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            };
            match self
                .broker
                .consume(TASKS_QUEUE, GROUP_WORKERS, &worker_id.to_string(), 1, 30_000)
                .await
            {
                Ok(messages) => {
                    for msg in messages {
                        self.process_task(&msg, worker_id).await;
                    }
                }
                Err(e) => {
                    if self.agent.is_running() {
                        warn!("task loop error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    /// Consume review requests from `tasks:qa`.
    pub async fn qa_loop(self: Arc<Self>) {
        while self.agent.is_running() {
            let Some(worker_id) = self.agent.worker_id().await else {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            };
            match self
                .broker
                .consume(TASKS_QA, GROUP_REVIEWERS, &worker_id.to_string(), 1, 30_000)
                .await
            {
                Ok(messages) => {
                    for msg in messages {
                        self.process_qa(&msg, worker_id).await;
                    }
                }
                Err(e) => {
                    if self.agent.is_running() {
                        warn!("qa loop error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    pub async fn process_task(&self, msg: &StreamMessage, worker_id: Uuid) {
        let task_id = msg.field("task_id").unwrap_or_default().to_string();
        info!("executing task {task_id}");

        let fields = match self.extract_prompt(msg, "signed_worker_prompt", "worker_prompt") {
            Err(()) => execution_fields(&task_id, worker_id, false, None, Some("prompt signature invalid")),
            Ok(prompt) => match self.executor.execute(&prompt, &task_id).await {
                Ok(result) => execution_fields(
                    &task_id,
                    worker_id,
                    result.success,
                    result.output_path.as_deref(),
                    result.error_message.as_deref(),
                ),
                Err(e) => execution_fields(&task_id, worker_id, false, None, Some(&e.to_string())),
            },
        };

        if let Err(e) = self.broker.publish(TASKS_RESULTS, fields).await {
            warn!("publish result for task {task_id}: {e}");
        }
        if let Err(e) = self.broker.ack(TASKS_QUEUE, GROUP_WORKERS, &msg.id).await {
            warn!("ack task message {}: {e}", msg.id);
        }
    }

    pub async fn process_qa(&self, msg: &StreamMessage, worker_id: Uuid) {
        let task_id = msg.field("task_id").unwrap_or_default().to_string();
        info!("reviewing task {task_id}");

        let fields = match self.extract_prompt(msg, "signed_qa_prompt", "qa_prompt") {
            Err(()) => qa_fields(&task_id, worker_id, false, "", Some("prompt signature invalid")),
            Ok(prompt) => match self.executor.review(&prompt, &task_id).await {
                Ok(result) => qa_fields(
                    &task_id,
                    worker_id,
                    result.passed,
                    &result.feedback,
                    result.error_message.as_deref(),
                ),
                Err(e) => qa_fields(&task_id, worker_id, false, "", Some(&e.to_string())),
            },
        };

        if let Err(e) = self.broker.publish(TASKS_RESULTS, fields).await {
            warn!("publish qa result for task {task_id}: {e}");
        }
        if let Err(e) = self.broker.ack(TASKS_QA, GROUP_REVIEWERS, &msg.id).await {
            warn!("ack qa message {}: {e}", msg.id);
        }
    }

    /// Signed envelope when present (must verify), raw field otherwise.
    fn extract_prompt(
        &self,
        msg: &StreamMessage,
        signed_key: &str,
        raw_key: &str,
    ) -> Result<String, ()> {
        if let Some(raw) = msg.field(signed_key) {
            let Some(verifier) = &self.verifier else {
                warn!("signed prompt received but no secret configured");
                return Err(());
            };
            return verifier.extract_from_wire(raw).map_err(|e| {
                warn!("envelope verification failed: {e}");
            });
        }
        Ok(msg.field(raw_key).unwrap_or_default().to_string())
    }
}

fn execution_fields(
    task_id: &str,
    worker_id: Uuid,
    success: bool,
    output_path: Option<&str>,
    error_message: Option<&str>,
) -> HashMap<String, String> {
    HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("worker_id".to_string(), worker_id.to_string()),
        ("type".to_string(), "execution".to_string()),
        ("success".to_string(), success.to_string()),
        (
            "output_path".to_string(),
            output_path.unwrap_or_default().to_string(),
        ),
        (
            "error_message".to_string(),
            error_message.unwrap_or_default().to_string(),
        ),
    ])
}

fn qa_fields(
    task_id: &str,
    worker_id: Uuid,
    passed: bool,
    feedback: &str,
    error_message: Option<&str>,
) -> HashMap<String, String> {
    HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("worker_id".to_string(), worker_id.to_string()),
        ("type".to_string(), "qa".to_string()),
        ("passed".to_string(), passed.to_string()),
        ("feedback".to_string(), feedback.to_string()),
        (
            "error_message".to_string(),
            error_message.unwrap_or_default().to_string(),
        ),
    ])
}
