//! Storage layer: uuid idempotency, eligibility filtering, stable ordering,
//! and the reporting queries.

use smsgate::storage::{MessageStatus, Storage, StorageError, MAX_RETRIES};

async fn test_store() -> Storage {
    Storage::open_in_memory().await.unwrap()
}

#[tokio::test]
async fn insert_assigns_pending_state() {
    let store = test_store().await;
    let row = store
        .insert_outgoing("u1", "+15551234567", "hello")
        .await
        .unwrap();

    assert_eq!(row.uuid, "u1");
    assert_eq!(row.status, MessageStatus::Pending);
    assert_eq!(row.retries, 0);
    assert!(row.device.is_none());
    assert!(row.created_at > 0);
}

#[tokio::test]
async fn duplicate_uuid_is_rejected() {
    let store = test_store().await;
    store
        .insert_outgoing("u1", "+15551234567", "hello")
        .await
        .unwrap();

    let err = store
        .insert_outgoing("u1", "+15559999999", "different body")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateUuid));
}

#[tokio::test]
async fn update_reflects_attempt_outcome() {
    let store = test_store().await;
    store
        .insert_outgoing("u1", "+15551234567", "hello")
        .await
        .unwrap();

    store
        .update_outgoing_status("u1", MessageStatus::Error, 2, "modem0")
        .await
        .unwrap();

    let row = store.get_outgoing("u1").await.unwrap();
    assert_eq!(row.status, MessageStatus::Error);
    assert_eq!(row.retries, 2);
    assert_eq!(row.device.as_deref(), Some("modem0"));
    assert!(row.updated_at >= row.created_at);
}

#[tokio::test]
async fn load_pending_filters_by_eligibility() {
    let store = test_store().await;
    for i in 0..4 {
        store
            .insert_outgoing(&format!("u{i}"), "+15551234567", "body")
            .await
            .unwrap();
    }
    // u1 delivered; u2 exhausted its retries; u3 errored but retryable
    store
        .update_outgoing_status("u1", MessageStatus::Processed, 1, "modem0")
        .await
        .unwrap();
    store
        .update_outgoing_status("u2", MessageStatus::Pending, MAX_RETRIES, "modem0")
        .await
        .unwrap();
    store
        .update_outgoing_status("u3", MessageStatus::Error, 1, "modem0")
        .await
        .unwrap();

    let pending = store.load_pending(10).await.unwrap();
    let uuids: Vec<&str> = pending.iter().map(|m| m.uuid.as_str()).collect();
    assert_eq!(uuids, vec!["u0", "u3"]);
}

#[tokio::test]
async fn load_pending_is_stable_and_bounded() {
    let store = test_store().await;
    for i in 0..10 {
        store
            .insert_outgoing(&format!("u{i:02}"), "+15551234567", "body")
            .await
            .unwrap();
    }

    let first = store.load_pending(5).await.unwrap();
    let second = store.load_pending(5).await.unwrap();
    assert_eq!(first.len(), 5);

    let uuids =
        |rows: &[smsgate::storage::OutgoingMessage]| -> Vec<String> {
            rows.iter().map(|m| m.uuid.clone()).collect()
        };
    // Same prefix, same order, when nothing changed in between
    assert_eq!(uuids(&first), uuids(&second));
    assert_eq!(uuids(&first), vec!["u00", "u01", "u02", "u03", "u04"]);
}

#[tokio::test]
async fn incoming_rows_are_append_only_records() {
    let store = test_store().await;
    let row = store
        .insert_incoming("+15550000001", "ping", "modem1")
        .await
        .unwrap();
    assert_eq!(row.mobile, "+15550000001");
    assert_eq!(row.device.as_deref(), Some("modem1"));

    let rows = store.incoming_messages(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].body, "ping");
}

#[tokio::test]
async fn status_summary_counts_by_code() {
    let store = test_store().await;
    for i in 0..5 {
        store
            .insert_outgoing(&format!("u{i}"), "+15551234567", "body")
            .await
            .unwrap();
    }
    store
        .update_outgoing_status("u0", MessageStatus::Processed, 1, "modem0")
        .await
        .unwrap();
    store
        .update_outgoing_status("u1", MessageStatus::Processed, 1, "modem0")
        .await
        .unwrap();
    store
        .update_outgoing_status("u2", MessageStatus::Error, 3, "modem0")
        .await
        .unwrap();

    assert_eq!(store.status_summary().await.unwrap(), [2, 2, 1]);
}

#[tokio::test]
async fn seven_day_counts_group_by_insert_day() {
    let store = test_store().await;
    for i in 0..3 {
        store
            .insert_outgoing(&format!("u{i}"), "+15551234567", "body")
            .await
            .unwrap();
    }

    let days = store.last_seven_days_counts().await.unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].1, 3);
}

#[tokio::test]
async fn outgoing_report_filters_by_status() {
    let store = test_store().await;
    for i in 0..3 {
        store
            .insert_outgoing(&format!("u{i}"), "+15551234567", "body")
            .await
            .unwrap();
    }
    store
        .update_outgoing_status("u1", MessageStatus::Processed, 1, "modem0")
        .await
        .unwrap();

    let processed = store
        .outgoing_messages(Some(MessageStatus::Processed), 10)
        .await
        .unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].uuid, "u1");

    let all = store.outgoing_messages(None, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    // Newest first
    assert_eq!(all[0].uuid, "u2");
}
