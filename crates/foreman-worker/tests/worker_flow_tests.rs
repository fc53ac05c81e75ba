//! Full pipeline exercise: PM schedules a task, an executing worker picks
//! it up and succeeds, a distinct reviewer approves it, and the task lands
//! in done, all over the shared broker, with signed prompts end to end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use foreman_core::broker::{
    MemoryBroker, StreamBroker, GROUP_PM, GROUP_REVIEWERS, GROUP_WORKERS, TASKS_QA, TASKS_QUEUE,
    TASKS_RESULTS,
};
use foreman_core::db::Db;
use foreman_core::envelope::PromptSigner;
use foreman_core::orchestrator::PmOrchestrator;
use foreman_core::registry::WorkerRegistry;
use foreman_core::state::TaskStateMachine;
use foreman_core::types::{NewTask, TaskPriority, TaskStatus, WorkerStatus};
use foreman_worker::agent::{Registration, WorkerAgent};
use foreman_worker::broker_client::HttpBroker;
use foreman_worker::config::WorkerConfig;
use foreman_worker::consumer::TaskConsumer;
use foreman_worker::executor::{ExecutionResult, Executor, ReviewResult};
use uuid::Uuid;

const SECRET: &str = "fleet-secret";

struct ScriptedExecutor {
    seen_prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, prompt: &str, _task_id: &str) -> Result<ExecutionResult> {
        self.seen_prompts.lock().unwrap().push(prompt.to_string());
        Ok(ExecutionResult {
            success: true,
            output_path: None,
            error_message: None,
            stdout: "done".to_string(),
            stderr: String::new(),
        })
    }

    async fn review(&self, prompt: &str, _task_id: &str) -> Result<ReviewResult> {
        self.seen_prompts.lock().unwrap().push(prompt.to_string());
        Ok(ReviewResult {
            passed: true,
            feedback: "PASS: verified".to_string(),
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
        prompt_secret: SECRET.to_string(),
        execute_timeout_s: 60,
        duration_s: 0,
    }
}

async fn make_consumer(
    broker: &Arc<MemoryBroker>,
    worker_id: Uuid,
) -> (Arc<TaskConsumer>, Arc<ScriptedExecutor>) {
    let http = Arc::new(HttpBroker::new("http://127.0.0.1:1").unwrap());
    let agent = Arc::new(WorkerAgent::new(worker_config(), Arc::clone(&http)).unwrap());
    agent
        .set_registration(Registration {
            worker_id,
            token: "t".to_string(),
            heartbeat_interval: 30,
        })
        .await;
    let executor = Arc::new(ScriptedExecutor {
        seen_prompts: Mutex::new(Vec::new()),
    });
    let consumer = Arc::new(TaskConsumer::new(
        Arc::clone(broker) as Arc<dyn StreamBroker>,
        agent,
        Arc::clone(&executor) as Arc<dyn Executor>,
        Some(PromptSigner::new(SECRET)),
    ));
    (consumer, executor)
}

#[tokio::test]
async fn task_travels_from_ready_to_done_across_the_fleet() {
    let db = Arc::new({
        let db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    });
    let broker = Arc::new(MemoryBroker::new(30));
    broker.initialize().await.unwrap();
    let registry = Arc::new(WorkerRegistry::new(60, 86_400));
    let state = Arc::new(
        TaskStateMachine::new(Arc::clone(&db), Arc::clone(&broker) as Arc<dyn StreamBroker>)
            .with_signer(PromptSigner::new(SECRET)),
    );

    let project = db.insert_project("demo", "", "").unwrap();
    let phase = db
        .insert_phase(project.id, "core", None, "phase-1-core", 1)
        .unwrap();

    let (executor_rec, _) = registry
        .register("executor", "linux", vec!["native".to_string()], "claude-code")
        .await;
    let (reviewer_rec, _) = registry
        .register("reviewer", "linux", vec!["native".to_string()], "claude-code")
        .await;

    let pm = PmOrchestrator::new(
        project.id,
        Arc::clone(&db),
        Arc::clone(&broker) as Arc<dyn StreamBroker>,
        Arc::clone(&registry),
        Arc::clone(&state),
        1,
        200,
    );

    let task = db
        .create_task(&NewTask {
            project_id: project.id,
            phase_id: phase.id,
            title: "implement login".to_string(),
            description: None,
            priority: TaskPriority::High,
            depends_on: vec![],
            worker_prompt: Some("write the login handler".to_string()),
            qa_prompt: Some("review the login handler".to_string()),
            branch_name: None,
        })
        .unwrap();

    // PM queues the ready task (two idle workers are available).
    pm.schedule_pass().await.unwrap();
    assert_eq!(
        db.get_task(task.id).unwrap().unwrap().status,
        TaskStatus::Queued
    );

    // The executing worker claims the queue message; the PM records who
    // took it.
    let (exec_consumer, exec_executor) = make_consumer(&broker, executor_rec.id).await;
    let work = broker
        .consume(
            TASKS_QUEUE,
            GROUP_WORKERS,
            &executor_rec.id.to_string(),
            1,
            500,
        )
        .await
        .unwrap();
    assert_eq!(work.len(), 1);
    state
        .transition(
            task.id,
            TaskStatus::InProgress,
            Some("claimed"),
            "pm",
            Some(&serde_json::json!({ "worker_id": executor_rec.id.to_string() })),
            None,
        )
        .await
        .unwrap();
    registry.set_busy(executor_rec.id, task.id).await;

    exec_consumer.process_task(&work[0], executor_rec.id).await;
    assert_eq!(
        exec_executor.seen_prompts.lock().unwrap().as_slice(),
        ["write the login handler"]
    );

    // PM consumes the execution result and assigns the other worker.
    let results = broker
        .consume(TASKS_RESULTS, GROUP_PM, "pm-0", 1, 500)
        .await
        .unwrap();
    pm.process_result(&results[0]).await.unwrap();
    broker
        .ack(TASKS_RESULTS, GROUP_PM, &results[0].id)
        .await
        .unwrap();

    let in_review = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(in_review.status, TaskStatus::Review);
    assert_eq!(in_review.worker_id, Some(executor_rec.id));
    assert_eq!(in_review.reviewer_id, Some(reviewer_rec.id));
    assert_eq!(
        registry.get(reviewer_rec.id).await.unwrap().status,
        WorkerStatus::Busy
    );

    // The reviewer picks up the QA message and approves.
    let (qa_consumer, qa_executor) = make_consumer(&broker, reviewer_rec.id).await;
    let qa = broker
        .consume(
            TASKS_QA,
            GROUP_REVIEWERS,
            &reviewer_rec.id.to_string(),
            1,
            500,
        )
        .await
        .unwrap();
    assert_eq!(qa.len(), 1);
    qa_consumer.process_qa(&qa[0], reviewer_rec.id).await;
    assert_eq!(
        qa_executor.seen_prompts.lock().unwrap().as_slice(),
        ["review the login handler"]
    );

    let verdicts = broker
        .consume(TASKS_RESULTS, GROUP_PM, "pm-0", 1, 500)
        .await
        .unwrap();
    pm.process_result(&verdicts[0]).await.unwrap();

    let done = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert!(done.completed_at.is_some());
    assert_eq!(
        registry.get(reviewer_rec.id).await.unwrap().status,
        WorkerStatus::Idle
    );

    // Full ledger: creation, queued, in_progress, review, done.
    let history: Vec<HashMap<String, String>> = db
        .list_history(task.id)
        .unwrap()
        .iter()
        .map(|h| {
            HashMap::from([
                ("from".to_string(), h.from_status.to_string()),
                ("to".to_string(), h.to_status.to_string()),
            ])
        })
        .collect();
    assert_eq!(history.len(), 5);
    assert_eq!(history[4].get("to").map(String::as_str), Some("done"));
}
