use std::collections::HashMap;

use anyhow::Result;

/// Environment lookup merged with a `.env` file (`KEY=VALUE` lines, `#`
/// comments). Process environment wins over the file.
pub struct Env {
    dotenv: HashMap<String, String>,
}

impl Env {
    pub fn load() -> Self {
        Self {
            dotenv: parse_dotenv(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.dotenv.get(key).cloned())
    }

    pub fn str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn opt(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn u16(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

/// Server-side configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub web_bind: String,
    pub web_port: u16,
    pub data_dir: String,

    /// HMAC secret for the prompt envelope. Empty = prompt signing disabled.
    pub prompt_secret: String,

    /// Repository the git collaborator operates on. Empty = VCS disabled.
    pub repo_path: String,

    // Registry
    pub worker_ttl_s: i64,
    pub worker_token_ttl_s: i64,
    pub heartbeat_interval_s: u64,

    // Orchestrator
    pub scheduler_tick_s: u64,
    pub results_block_ms: u64,

    // Broker
    pub claim_timeout_s: i64,
    pub stream_maxlen: usize,
    pub board_maxlen: usize,
    pub trim_interval_s: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let env = Env::load();

        Ok(Config {
            web_bind: env.str("WEB_BIND", "127.0.0.1"),
            web_port: env.u16("WEB_PORT", 8000),
            data_dir: env.str("DATA_DIR", "store"),
            prompt_secret: env.str("PROMPT_SECRET", ""),
            repo_path: env.str("REPO_PATH", ""),
            worker_ttl_s: env.i64("WORKER_TTL_S", 60),
            worker_token_ttl_s: env.i64("WORKER_TOKEN_TTL_S", 86_400),
            heartbeat_interval_s: env.u64("HEARTBEAT_INTERVAL_S", 30),
            scheduler_tick_s: env.u64("SCHEDULER_TICK_S", 5),
            results_block_ms: env.u64("RESULTS_BLOCK_MS", 5_000),
            claim_timeout_s: env.i64("CLAIM_TIMEOUT_S", 30),
            stream_maxlen: env.usize("STREAM_MAXLEN", 1_000),
            board_maxlen: env.usize("BOARD_MAXLEN", 5_000),
            trim_interval_s: env.u64("TRIM_INTERVAL_S", 300),
        })
    }

    pub fn db_path(&self) -> String {
        format!("{}/foreman.db", self.data_dir)
    }
}
