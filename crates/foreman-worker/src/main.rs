use std::sync::Arc;

use anyhow::Context;
use foreman_core::envelope::PromptSigner;
use foreman_worker::agent::WorkerAgent;
use foreman_worker::broker_client::HttpBroker;
use foreman_worker::config::WorkerConfig;
use foreman_worker::consumer::TaskConsumer;
use foreman_worker::executor;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "foreman_worker=info,foreman_core=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();

    let broker = Arc::new(HttpBroker::new(config.server_url.clone())?);
    let agent = Arc::new(WorkerAgent::new(config.clone(), Arc::clone(&broker))?);

    // Registration with a short retry window: the server may still be
    // coming up alongside us.
    let mut attempts = 0u32;
    loop {
        match agent.register().await {
            Ok(()) => break,
            Err(e) if attempts < 5 => {
                attempts += 1;
                warn!("registration attempt {attempts} failed: {e}");
                tokio::time::sleep(std::time::Duration::from_secs(2 * u64::from(attempts))).await;
            }
            Err(e) => return Err(e).context("registration failed"),
        }
    }

    let executor = executor::create_executor(
        &config.executor_type,
        &config.workspace_dir,
        &config.executor_cmd,
        config.execute_timeout_s,
    )?;

    let verifier = if config.prompt_secret.is_empty() {
        warn!("PROMPT_SECRET not set, signed prompts will be refused");
        None
    } else {
        Some(PromptSigner::new(&config.prompt_secret))
    };

    let consumer = Arc::new(TaskConsumer::new(
        Arc::clone(&broker) as Arc<dyn foreman_core::broker::StreamBroker>,
        Arc::clone(&agent),
        executor,
        verifier,
    ));

    let heartbeat = tokio::spawn(Arc::clone(&agent).heartbeat_loop());
    let tasks = tokio::spawn(Arc::clone(&consumer).task_loop());
    let qa = tokio::spawn(Arc::clone(&consumer).qa_loop());

    if config.duration_s > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            () = tokio::time::sleep(std::time::Duration::from_secs(config.duration_s)) => {
                info!("run duration elapsed");
            }
        }
    } else {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }

    agent.shutdown().await;
    heartbeat.abort();
    tasks.abort();
    qa.abort();

    Ok(())
}
