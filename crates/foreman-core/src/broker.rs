use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

// ── Stream / group names ─────────────────────────────────────────────────

pub const TASKS_QUEUE: &str = "tasks:queue";
pub const TASKS_QA: &str = "tasks:qa";
pub const TASKS_RESULTS: &str = "tasks:results";
pub const EVENTS_BOARD: &str = "events:board";

pub const GROUP_WORKERS: &str = "workers";
pub const GROUP_REVIEWERS: &str = "reviewers";
pub const GROUP_PM: &str = "pm";

/// (stream, consumer group) pairs created at initialization.
pub const STREAM_GROUPS: &[(&str, &str)] = &[
    (TASKS_QUEUE, GROUP_WORKERS),
    (TASKS_QA, GROUP_REVIEWERS),
    (TASKS_RESULTS, GROUP_PM),
];

// ── Messages ─────────────────────────────────────────────────────────────

/// One stream entry. Fields are a flat string map: scalar values are raw
/// strings, compound values are JSON strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Broker-assigned id, used for acknowledgement.
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// JSON-decode a field, falling back to the raw string.
    pub fn decode_field(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.fields.get(key)?;
        Some(
            serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone())),
        )
    }
}

// ── Trait ────────────────────────────────────────────────────────────────

/// Reliable at-least-once message fabric between the PM and workers.
///
/// Contract: per-stream FIFO, per-group at-least-once delivery, messages
/// stay pending for their consumer until acked and are redelivered within
/// the group when the claim deadline lapses.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create streams and consumer groups if absent. Must be idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Atomically append to a stream; returns the broker-assigned id.
    async fn publish(&self, stream: &str, fields: HashMap<String, String>) -> Result<String>;

    /// Blocking fetch of new (or reclaimed) messages for a group/consumer
    /// pair. Returns at most `count` messages; blocks up to `block_ms`.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>>;

    /// Mark a message handled. Idempotent.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()>;

    /// Bound stream length approximately; never drops pending entries.
    async fn trim(&self, stream: &str, maxlen: usize) -> Result<()>;

    /// Publish a board event on `events:board`.
    async fn publish_board_event(
        &self,
        event: &str,
        mut fields: HashMap<String, String>,
    ) -> Result<()> {
        fields.insert("event".to_string(), event.to_string());
        self.publish(EVENTS_BOARD, fields).await?;
        Ok(())
    }
}

// ── In-memory engine ─────────────────────────────────────────────────────

struct Entry {
    seq: u64,
    fields: HashMap<String, String>,
}

struct PendingEntry {
    consumer: String,
    deadline: DateTime<Utc>,
    deliveries: u32,
}

#[derive(Default)]
struct GroupState {
    /// Highest seq handed out as a *new* message to this group.
    last_delivered: u64,
    /// seq → claim for messages consumed but not yet acked.
    pending: HashMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<Entry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// The authoritative in-process stream engine. Lives in the server; remote
/// workers reach it through the HTTP relay with the same trait.
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    claim_timeout: ChronoDuration,
}

impl MemoryBroker {
    pub fn new(claim_timeout_s: i64) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            claim_timeout: ChronoDuration::seconds(claim_timeout_s),
        }
    }

    /// Claim timeout below one second, for redelivery tests.
    pub fn with_claim_timeout_ms(claim_timeout_ms: i64) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            claim_timeout: ChronoDuration::milliseconds(claim_timeout_ms),
        }
    }

    /// Current number of retained entries in a stream.
    pub async fn stream_len(&self, stream: &str) -> usize {
        let map = self.streams.lock().await;
        map.get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Try to hand out up to `count` messages: reclaimed expired entries
    /// first (FIFO), then new entries past the group cursor.
    async fn poll(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamMessage> {
        let now = Utc::now();
        let mut map = self.streams.lock().await;
        let state = map.entry(stream.to_string()).or_default();
        let StreamState { entries, groups, .. } = state;
        let group_state = groups.entry(group.to_string()).or_default();

        let mut batch: Vec<StreamMessage> = Vec::new();

        let mut expired: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();

        for seq in expired {
            if batch.len() >= count {
                break;
            }
            let Some(entry) = entries.iter().find(|e| e.seq == seq) else {
                // Entry trimmed away while pending should not happen; drop
                // the stale claim.
                group_state.pending.remove(&seq);
                continue;
            };
            if let Some(p) = group_state.pending.get_mut(&seq) {
                tracing::debug!(
                    "reclaiming {stream}/{seq} from {} for {consumer} (delivery {})",
                    p.consumer,
                    p.deliveries + 1
                );
                p.consumer = consumer.to_string();
                p.deadline = now + self.claim_timeout;
                p.deliveries += 1;
            }
            batch.push(StreamMessage {
                id: seq.to_string(),
                fields: entry.fields.clone(),
            });
        }

        for entry in entries.iter() {
            if batch.len() >= count {
                break;
            }
            if entry.seq <= group_state.last_delivered {
                continue;
            }
            group_state.last_delivered = entry.seq;
            group_state.pending.insert(
                entry.seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    deadline: now + self.claim_timeout,
                    deliveries: 1,
                },
            );
            batch.push(StreamMessage {
                id: entry.seq.to_string(),
                fields: entry.fields.clone(),
            });
        }

        batch
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn initialize(&self) -> Result<()> {
        let mut map = self.streams.lock().await;
        for (stream, group) in STREAM_GROUPS {
            let state = map.entry((*stream).to_string()).or_default();
            state.groups.entry((*group).to_string()).or_default();
        }
        map.entry(EVENTS_BOARD.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, stream: &str, fields: HashMap<String, String>) -> Result<String> {
        let id = {
            let mut map = self.streams.lock().await;
            let state = map.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.entries.push_back(Entry { seq, fields });
            seq.to_string()
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        let started = Instant::now();
        loop {
            let batch = self.poll(stream, group, consumer, count).await;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed >= block_ms {
                return Ok(Vec::new());
            }
            // Wake on publish; the short sleep also re-checks for claims
            // whose deadline lapsed while we were parked.
            let remaining = block_ms - elapsed;
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(std::time::Duration::from_millis(remaining.min(200))) => {}
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        let Ok(seq) = message_id.parse::<u64>() else {
            return Ok(());
        };
        let mut map = self.streams.lock().await;
        if let Some(state) = map.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&seq);
            }
        }
        Ok(())
    }

    async fn trim(&self, stream: &str, maxlen: usize) -> Result<()> {
        let mut map = self.streams.lock().await;
        let Some(state) = map.get_mut(stream) else {
            return Ok(());
        };
        while state.entries.len() > maxlen {
            let Some(front) = state.entries.front() else {
                break;
            };
            let seq = front.seq;
            let claimed = state.groups.values().any(|g| g.pending.contains_key(&seq));
            if claimed {
                break;
            }
            state.entries.pop_front();
        }
        Ok(())
    }
}
