use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{WorkerRecord, WorkerStatus};

struct StoredWorker {
    record: WorkerRecord,
    token: String,
    expires_at: DateTime<Utc>,
}

struct StoredToken {
    worker_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<Uuid, StoredWorker>,
    tokens: HashMap<String, StoredToken>,
}

/// Ephemeral worker presence with TTLs.
///
/// Worker records expire unless renewed by heartbeat; auth tokens live
/// longer so an expired worker can re-register transparently. Every
/// operation is safe to retry, and expiry is a first-class outcome
/// (heartbeat returns false, reads return nothing).
pub struct WorkerRegistry {
    inner: Mutex<Inner>,
    ttl: Duration,
    token_ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(ttl_s: i64, token_ttl_s: i64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl: Duration::seconds(ttl_s),
            token_ttl: Duration::seconds(token_ttl_s),
        }
    }

    /// Register a worker and mint a fresh 256-bit hex auth token.
    pub async fn register(
        &self,
        name: &str,
        platform: &str,
        capabilities: Vec<String>,
        executor_type: &str,
    ) -> (WorkerRecord, String) {
        let mut token_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_bytes);
        let token = hex::encode(token_bytes);

        let record = WorkerRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            platform: platform.to_string(),
            capabilities,
            executor_type: executor_type.to_string(),
            status: WorkerStatus::Idle,
            current_task_id: None,
        };

        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.tokens.insert(
            token.clone(),
            StoredToken {
                worker_id: record.id,
                expires_at: now + self.token_ttl,
            },
        );
        inner.workers.insert(
            record.id,
            StoredWorker {
                record: record.clone(),
                token: token.clone(),
                expires_at: now + self.ttl,
            },
        );
        (record, token)
    }

    /// Renew the TTL. Returns true iff the record still exists.
    pub async fn heartbeat(&self, worker_id: Uuid) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner.workers.get_mut(&worker_id) {
            if w.expires_at > now {
                w.expires_at = now + self.ttl;
                return true;
            }
        }
        inner.workers.remove(&worker_id);
        false
    }

    pub async fn get(&self, worker_id: Uuid) -> Option<WorkerRecord> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        inner
            .workers
            .get(&worker_id)
            .filter(|w| w.expires_at > now)
            .map(|w| w.record.clone())
    }

    /// All live workers, ordered by id (the stable scan order).
    pub async fn list_all(&self) -> Vec<WorkerRecord> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.workers.retain(|_, w| w.expires_at > now);
        let mut records: Vec<WorkerRecord> =
            inner.workers.values().map(|w| w.record.clone()).collect();
        records.sort_by_key(|r| r.id.to_string());
        records
    }

    pub async fn set_busy(&self, worker_id: Uuid, task_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner.workers.get_mut(&worker_id) {
            w.record.status = WorkerStatus::Busy;
            w.record.current_task_id = Some(task_id);
        }
    }

    pub async fn set_idle(&self, worker_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner.workers.get_mut(&worker_id) {
            w.record.status = WorkerStatus::Idle;
            w.record.current_task_id = None;
        }
    }

    /// Remove a worker and its token.
    pub async fn deregister(&self, worker_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner.workers.remove(&worker_id) {
            inner.tokens.remove(&w.token);
        }
    }

    /// Resolve an auth token to a worker id, or nothing when unknown or
    /// expired.
    pub async fn resolve_token(&self, token: &str) -> Option<Uuid> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        inner
            .tokens
            .get(token)
            .filter(|t| t.expires_at > now)
            .map(|t| t.worker_id)
    }
}
