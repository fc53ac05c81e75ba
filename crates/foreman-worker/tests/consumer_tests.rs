use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use foreman_core::broker::{
    MemoryBroker, StreamBroker, GROUP_PM, GROUP_REVIEWERS, GROUP_WORKERS, TASKS_QA, TASKS_QUEUE,
    TASKS_RESULTS,
};
use foreman_core::envelope::PromptSigner;
use foreman_worker::agent::{Registration, WorkerAgent};
use foreman_worker::broker_client::HttpBroker;
use foreman_worker::config::WorkerConfig;
use foreman_worker::consumer::TaskConsumer;
use foreman_worker::executor::{ExecutionResult, Executor, ReviewResult, ShellExecutor};
use uuid::Uuid;

// ── Fixtures ─────────────────────────────────────────────────────────────

struct MockExecutor {
    prompts: Mutex<Vec<String>>,
    fail_execution: bool,
    error: bool,
    review_passes: bool,
}

impl MockExecutor {
    fn succeeding() -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            fail_execution: false,
            error: false,
            review_passes: true,
        }
    }

    fn failing() -> Self {
        Self {
            fail_execution: true,
            ..Self::succeeding()
        }
    }

    fn erroring() -> Self {
        Self {
            error: true,
            ..Self::succeeding()
        }
    }

    fn rejecting_reviews() -> Self {
        Self {
            review_passes: false,
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, prompt: &str, _task_id: &str) -> Result<ExecutionResult> {
        if self.error {
            anyhow::bail!("executor crashed");
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(ExecutionResult {
            success: !self.fail_execution,
            output_path: Some("/tmp/out".to_string()),
            error_message: self.fail_execution.then(|| "it broke".to_string()),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn review(&self, prompt: &str, _task_id: &str) -> Result<ReviewResult> {
        if self.error {
            anyhow::bail!("executor crashed");
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(ReviewResult {
            passed: self.review_passes,
            feedback: if self.review_passes {
                "PASS: fine".to_string()
            } else {
                "FAIL: broken".to_string()
            },
            error_message: None,
        })
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        server_url: "http://127.0.0.1:1".to_string(),
        worker_name: String::new(),
        executor_type: "claude-code".to_string(),
        executor_cmd: String::new(),
        workspace_dir: "/tmp".to_string(),
        heartbeat_interval_s: 30,
        registration_token: String::new(),
        prompt_secret: String::new(),
        execute_timeout_s: 60,
        duration_s: 0,
    }
}

struct Rig {
    broker: Arc<MemoryBroker>,
    consumer: TaskConsumer,
    executor: Arc<MockExecutor>,
    worker_id: Uuid,
}

async fn rig(executor: MockExecutor, verifier: Option<PromptSigner>) -> Rig {
    let broker = Arc::new(MemoryBroker::with_claim_timeout_ms(50));
    broker.initialize().await.unwrap();

    let http = Arc::new(HttpBroker::new("http://127.0.0.1:1").unwrap());
    let agent = Arc::new(WorkerAgent::new(worker_config(), Arc::clone(&http)).unwrap());
    let worker_id = Uuid::new_v4();
    agent
        .set_registration(Registration {
            worker_id,
            token: "test-token".to_string(),
            heartbeat_interval: 30,
        })
        .await;

    let executor = Arc::new(executor);
    let consumer = TaskConsumer::new(
        Arc::clone(&broker) as Arc<dyn StreamBroker>,
        agent,
        Arc::clone(&executor) as Arc<dyn Executor>,
        verifier,
    );
    Rig {
        broker,
        consumer,
        executor,
        worker_id,
    }
}

async fn publish_work(broker: &MemoryBroker, task_id: Uuid, extra: &[(&str, &str)]) {
    let mut fields: HashMap<String, String> = HashMap::from([
        ("task_id".to_string(), task_id.to_string()),
        ("title".to_string(), "build".to_string()),
    ]);
    for (k, v) in extra {
        fields.insert((*k).to_string(), (*v).to_string());
    }
    broker.publish(TASKS_QUEUE, fields).await.unwrap();
}

async fn take_result(broker: &MemoryBroker) -> HashMap<String, String> {
    let mut results = broker
        .consume(TASKS_RESULTS, GROUP_PM, "pm-0", 1, 500)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    results.pop().unwrap().fields
}

/// The work message should be acked: after the claim deadline nobody else
/// in the group can reclaim it.
async fn assert_queue_drained(broker: &MemoryBroker, stream: &str, group: &str) {
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let reclaimed = broker.consume(stream, group, "other", 1, 100).await.unwrap();
    assert!(reclaimed.is_empty(), "message was not acked");
}

// ── Execution flow ───────────────────────────────────────────────────────

#[tokio::test]
async fn successful_execution_publishes_result_and_acks() {
    let rig = rig(MockExecutor::succeeding(), None).await;
    let task_id = Uuid::new_v4();

    publish_work(&rig.broker, task_id, &[("worker_prompt", "write the parser")]).await;
    let msgs = rig
        .broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_task(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("type").map(String::as_str), Some("execution"));
    assert_eq!(result.get("success").map(String::as_str), Some("true"));
    assert_eq!(
        result.get("task_id").map(String::as_str),
        Some(task_id.to_string().as_str())
    );
    assert_eq!(
        result.get("worker_id").map(String::as_str),
        Some(rig.worker_id.to_string().as_str())
    );

    assert_eq!(
        rig.executor.prompts.lock().unwrap().as_slice(),
        ["write the parser"]
    );
    assert_queue_drained(&rig.broker, TASKS_QUEUE, GROUP_WORKERS).await;
}

#[tokio::test]
async fn failed_execution_reports_the_error() {
    let rig = rig(MockExecutor::failing(), None).await;
    let task_id = Uuid::new_v4();

    publish_work(&rig.broker, task_id, &[("worker_prompt", "p")]).await;
    let msgs = rig
        .broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_task(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("success").map(String::as_str), Some("false"));
    assert_eq!(
        result.get("error_message").map(String::as_str),
        Some("it broke")
    );
}

#[tokio::test]
async fn executor_crash_still_produces_a_failure_result() {
    let rig = rig(MockExecutor::erroring(), None).await;
    let task_id = Uuid::new_v4();

    publish_work(&rig.broker, task_id, &[("worker_prompt", "p")]).await;
    let msgs = rig
        .broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_task(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("success").map(String::as_str), Some("false"));
    assert!(result
        .get("error_message")
        .is_some_and(|e| e.contains("executor crashed")));
    assert_queue_drained(&rig.broker, TASKS_QUEUE, GROUP_WORKERS).await;
}

// ── Envelope handling ────────────────────────────────────────────────────

#[tokio::test]
async fn signed_prompt_is_verified_and_extracted() {
    let signer = PromptSigner::new("shared-secret");
    let rig = rig(
        MockExecutor::succeeding(),
        Some(PromptSigner::new("shared-secret")),
    )
    .await;
    let task_id = Uuid::new_v4();

    let envelope = serde_json::to_string(&signer.sign("secret instructions")).unwrap();
    publish_work(&rig.broker, task_id, &[("signed_worker_prompt", &envelope)]).await;
    let msgs = rig
        .broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_task(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("success").map(String::as_str), Some("true"));
    assert_eq!(
        rig.executor.prompts.lock().unwrap().as_slice(),
        ["secret instructions"]
    );
}

#[tokio::test]
async fn tampered_envelope_is_an_execution_failure() {
    let signer = PromptSigner::new("shared-secret");
    let rig = rig(
        MockExecutor::succeeding(),
        Some(PromptSigner::new("shared-secret")),
    )
    .await;
    let task_id = Uuid::new_v4();

    let mut signed = signer.sign("original");
    signed.prompt = "injected".to_string();
    let envelope = serde_json::to_string(&signed).unwrap();
    publish_work(&rig.broker, task_id, &[("signed_worker_prompt", &envelope)]).await;
    let msgs = rig
        .broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_task(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("success").map(String::as_str), Some("false"));
    assert_eq!(
        result.get("error_message").map(String::as_str),
        Some("prompt signature invalid")
    );
    // The executor never saw the injected text.
    assert!(rig.executor.prompts.lock().unwrap().is_empty());
    assert_queue_drained(&rig.broker, TASKS_QUEUE, GROUP_WORKERS).await;
}

#[tokio::test]
async fn signed_prompt_without_a_secret_is_refused() {
    let signer = PromptSigner::new("shared-secret");
    let rig = rig(MockExecutor::succeeding(), None).await;
    let task_id = Uuid::new_v4();

    let envelope = serde_json::to_string(&signer.sign("p")).unwrap();
    publish_work(&rig.broker, task_id, &[("signed_worker_prompt", &envelope)]).await;
    let msgs = rig
        .broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_task(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("success").map(String::as_str), Some("false"));
    assert_eq!(
        result.get("error_message").map(String::as_str),
        Some("prompt signature invalid")
    );
}

// ── QA flow ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn qa_review_publishes_pass_verdict() {
    let rig = rig(MockExecutor::succeeding(), None).await;
    let task_id = Uuid::new_v4();

    rig.broker
        .publish(
            TASKS_QA,
            HashMap::from([
                ("task_id".to_string(), task_id.to_string()),
                ("qa_prompt".to_string(), "review the diff".to_string()),
            ]),
        )
        .await
        .unwrap();
    let msgs = rig
        .broker
        .consume(TASKS_QA, GROUP_REVIEWERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_qa(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("type").map(String::as_str), Some("qa"));
    assert_eq!(result.get("passed").map(String::as_str), Some("true"));
    assert_eq!(
        result.get("feedback").map(String::as_str),
        Some("PASS: fine")
    );
    assert_queue_drained(&rig.broker, TASKS_QA, GROUP_REVIEWERS).await;
}

#[tokio::test]
async fn qa_review_publishes_fail_verdict() {
    let rig = rig(MockExecutor::rejecting_reviews(), None).await;
    let task_id = Uuid::new_v4();

    rig.broker
        .publish(
            TASKS_QA,
            HashMap::from([
                ("task_id".to_string(), task_id.to_string()),
                ("qa_prompt".to_string(), "review".to_string()),
            ]),
        )
        .await
        .unwrap();
    let msgs = rig
        .broker
        .consume(TASKS_QA, GROUP_REVIEWERS, &rig.worker_id.to_string(), 1, 500)
        .await
        .unwrap();
    rig.consumer.process_qa(&msgs[0], rig.worker_id).await;

    let result = take_result(&rig.broker).await;
    assert_eq!(result.get("passed").map(String::as_str), Some("false"));
    assert_eq!(
        result.get("feedback").map(String::as_str),
        Some("FAIL: broken")
    );
}

// ── Shell executor ───────────────────────────────────────────────────────

#[tokio::test]
async fn shell_executor_pipes_prompt_through_command() {
    let executor = ShellExecutor::new("/tmp", "cat", 30);
    let result = executor.execute("round trip", "t1").await.unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "round trip");
}

#[tokio::test]
async fn shell_executor_review_parses_verdict() {
    let passing = ShellExecutor::new("/tmp", "echo PASS: all good", 30);
    let review = passing.review("ignored", "t1").await.unwrap();
    assert!(review.passed);

    let failing = ShellExecutor::new("/tmp", "echo FAIL: nope", 30);
    let review = failing.review("ignored", "t1").await.unwrap();
    assert!(!review.passed);

    let erroring = ShellExecutor::new("/tmp", "exit 3", 30);
    let review = erroring.review("ignored", "t1").await.unwrap();
    assert!(!review.passed);
}
