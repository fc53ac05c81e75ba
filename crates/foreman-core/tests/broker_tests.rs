use std::collections::HashMap;

use foreman_core::broker::{
    MemoryBroker, StreamBroker, EVENTS_BOARD, GROUP_PM, GROUP_WORKERS, TASKS_QUEUE, TASKS_RESULTS,
};

fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

// ── Basic publish / consume / ack ────────────────────────────────────────

#[tokio::test]
async fn publish_consume_ack_roundtrip() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    let id = broker
        .publish(TASKS_QUEUE, fields(&[("task_id", "t1"), ("title", "build")]))
        .await
        .unwrap();

    let messages = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].field("task_id"), Some("t1"));

    broker.ack(TASKS_QUEUE, GROUP_WORKERS, &id).await.unwrap();

    // Nothing new and nothing pending to reclaim.
    let empty = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn per_stream_fifo_order() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    for i in 0..5 {
        broker
            .publish(TASKS_QUEUE, fields(&[("n", &i.to_string())]))
            .await
            .unwrap();
    }

    let messages = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 10, 100)
        .await
        .unwrap();
    let order: Vec<&str> = messages.iter().filter_map(|m| m.field("n")).collect();
    assert_eq!(order, ["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn consumed_but_unacked_is_invisible_until_deadline() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    broker
        .publish(TASKS_QUEUE, fields(&[("task_id", "t1")]))
        .await
        .unwrap();
    let first = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // Claim is live; a second consumer in the group sees nothing.
    let second = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w2", 1, 100)
        .await
        .unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn unacked_message_redelivers_to_another_consumer() {
    let broker = MemoryBroker::with_claim_timeout_ms(50);
    broker.initialize().await.unwrap();

    broker
        .publish(TASKS_QUEUE, fields(&[("task_id", "t1")]))
        .await
        .unwrap();
    let first = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // w1 dies without acking; after the claim deadline the message is
    // handed to w2.
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let redelivered = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w2", 1, 500)
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id, first[0].id);

    broker
        .ack(TASKS_QUEUE, GROUP_WORKERS, &redelivered[0].id)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let after_ack = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w3", 1, 100)
        .await
        .unwrap();
    assert!(after_ack.is_empty());
}

#[tokio::test]
async fn ack_is_idempotent_and_unknown_ids_are_harmless() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    let id = broker
        .publish(TASKS_RESULTS, fields(&[("task_id", "t1")]))
        .await
        .unwrap();
    broker
        .consume(TASKS_RESULTS, GROUP_PM, "pm-0", 1, 100)
        .await
        .unwrap();

    broker.ack(TASKS_RESULTS, GROUP_PM, &id).await.unwrap();
    broker.ack(TASKS_RESULTS, GROUP_PM, &id).await.unwrap();
    broker.ack(TASKS_RESULTS, GROUP_PM, "9999").await.unwrap();
    broker
        .ack(TASKS_RESULTS, GROUP_PM, "not-a-number")
        .await
        .unwrap();
}

// ── Groups ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn each_group_sees_every_message() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    broker
        .publish(TASKS_QUEUE, fields(&[("task_id", "t1")]))
        .await
        .unwrap();

    let workers = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    let auditors = broker
        .consume(TASKS_QUEUE, "auditors", "a1", 1, 100)
        .await
        .unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(auditors.len(), 1);
}

#[tokio::test]
async fn group_members_share_the_workload() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    for i in 0..4 {
        broker
            .publish(TASKS_QUEUE, fields(&[("n", &i.to_string())]))
            .await
            .unwrap();
    }

    let w1 = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 2, 100)
        .await
        .unwrap();
    let w2 = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w2", 2, 100)
        .await
        .unwrap();
    assert_eq!(w1.len(), 2);
    assert_eq!(w2.len(), 2);
    let mut all: Vec<&str> = w1.iter().chain(w2.iter()).filter_map(|m| m.field("n")).collect();
    all.sort_unstable();
    assert_eq!(all, ["0", "1", "2", "3"]);
}

// ── Initialization / blocking / trim ─────────────────────────────────────

#[tokio::test]
async fn initialize_is_idempotent() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();
    broker.initialize().await.unwrap();

    broker
        .publish(TASKS_QUEUE, fields(&[("task_id", "t1")]))
        .await
        .unwrap();
    // Re-initializing after traffic must not reset cursors or drop data.
    broker.initialize().await.unwrap();
    let messages = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn blocking_consume_times_out_empty() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    let started = std::time::Instant::now();
    let messages = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 150)
        .await
        .unwrap();
    assert!(messages.is_empty());
    assert!(started.elapsed().as_millis() >= 140);
}

#[tokio::test]
async fn blocking_consume_wakes_on_publish() {
    let broker = std::sync::Arc::new(MemoryBroker::new(30));
    broker.initialize().await.unwrap();

    let consumer = {
        let broker = std::sync::Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 5_000)
                .await
                .unwrap()
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    broker
        .publish(TASKS_QUEUE, fields(&[("task_id", "t1")]))
        .await
        .unwrap();

    let messages = tokio::time::timeout(std::time::Duration::from_secs(2), consumer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn trim_bounds_length_but_keeps_pending() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    for i in 0..10 {
        broker
            .publish(TASKS_QUEUE, fields(&[("n", &i.to_string())]))
            .await
            .unwrap();
    }

    broker.trim(TASKS_QUEUE, 4).await.unwrap();
    assert_eq!(broker.stream_len(TASKS_QUEUE).await, 4);

    // Oldest survivors are still deliverable in order.
    let messages = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 10, 100)
        .await
        .unwrap();
    let order: Vec<&str> = messages.iter().filter_map(|m| m.field("n")).collect();
    assert_eq!(order, ["6", "7", "8", "9"]);

    // All four are pending now; trim to zero must not drop any of them.
    broker.trim(TASKS_QUEUE, 0).await.unwrap();
    assert_eq!(broker.stream_len(TASKS_QUEUE).await, 4);

    for msg in &messages {
        broker.ack(TASKS_QUEUE, GROUP_WORKERS, &msg.id).await.unwrap();
    }
    broker.trim(TASKS_QUEUE, 0).await.unwrap();
    assert_eq!(broker.stream_len(TASKS_QUEUE).await, 0);
}

// ── Board events / field decoding ────────────────────────────────────────

#[tokio::test]
async fn board_events_carry_the_event_field() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    broker
        .publish_board_event("task_transition", fields(&[("task_id", "t1")]))
        .await
        .unwrap();

    let events = broker
        .consume(EVENTS_BOARD, "observers", "dash", 10, 100)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field("event"), Some("task_transition"));
    assert_eq!(events[0].field("task_id"), Some("t1"));
}

#[tokio::test]
async fn decode_field_parses_json_and_falls_back_to_raw() {
    let broker = MemoryBroker::new(30);
    broker.initialize().await.unwrap();

    broker
        .publish(
            TASKS_QUEUE,
            fields(&[("payload", r#"{"a":1}"#), ("plain", "hello")]),
        )
        .await
        .unwrap();

    let messages = broker
        .consume(TASKS_QUEUE, GROUP_WORKERS, "w1", 1, 100)
        .await
        .unwrap();
    let msg = &messages[0];
    assert_eq!(
        msg.decode_field("payload").unwrap(),
        serde_json::json!({"a": 1})
    );
    assert_eq!(
        msg.decode_field("plain").unwrap(),
        serde_json::Value::String("hello".to_string())
    );
    assert!(msg.decode_field("missing").is_none());
}
