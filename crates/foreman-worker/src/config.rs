use foreman_core::config::Env;

/// Worker-side configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,
    /// Display name; empty lets the server generate one.
    pub worker_name: String,
    pub executor_type: String,
    /// Command line for the `shell` executor type.
    pub executor_cmd: String,
    pub workspace_dir: String,
    pub heartbeat_interval_s: u64,
    pub registration_token: String,
    /// Shared secret for verifying signed prompts. Empty = envelopes
    /// cannot be verified and are treated as execution failures.
    pub prompt_secret: String,
    pub execute_timeout_s: u64,
    /// Max run time in seconds; 0 = run until interrupted.
    pub duration_s: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let env = Env::load();
        Self {
            server_url: env.str("SERVER_URL", "http://localhost:8000"),
            worker_name: env.str("WORKER_NAME", ""),
            executor_type: env.str("EXECUTOR_TYPE", "claude-code"),
            executor_cmd: env.str("EXECUTOR_CMD", ""),
            workspace_dir: env.str("WORKSPACE_DIR", "/workspace"),
            heartbeat_interval_s: env.u64("HEARTBEAT_INTERVAL_S", 30),
            registration_token: env.str("REGISTRATION_TOKEN", ""),
            prompt_secret: env.str("PROMPT_SECRET", ""),
            execute_timeout_s: env.u64("EXECUTE_TIMEOUT_S", 3_600),
            duration_s: env.u64("DURATION_S", 0),
        }
    }
}
