//! Tamper detection against the live store.

mod common;

use athanor::prelude::*;
use athanor::FailureReason;
use chrono::{DateTime, Utc};
use common::{submission, test_config};
use tempfile::TempDir;

fn full_range() -> (DateTime<Utc>, DateTime<Utc>) {
    (
        DateTime::UNIX_EPOCH,
        Utc::now() + chrono::Duration::days(1),
    )
}

#[tokio::test]
async fn overwritten_row_is_flagged_and_breaks_its_successor() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let db_path = config.store.path.clone();
    let client = AuditClient::open(config).await.unwrap();
    let stream = StreamKey::new("P", "E");

    let mut committed = Vec::new();
    for n in 0..10 {
        committed.push(
            client
                .create_event(&stream, submission(&format!("user.step{n}"), Crud::Update, "u1"))
                .await
                .unwrap(),
        );
    }

    // Tamper with event 5 directly in the database. The schema trigger
    // blocks UPDATE, which is itself the immutability contract — the
    // attacker in this scenario has schema access and removes it first.
    let tampered_id = committed[4].id.to_string();
    {
        let raw = rusqlite::Connection::open(&db_path).unwrap();
        raw.execute("DROP TRIGGER audit_events_immutable_update", [])
            .unwrap();
        let changed = raw
            .execute(
                "UPDATE audit_events SET description = 'rewritten history' WHERE id = ?1",
                [&tampered_id],
            )
            .unwrap();
        assert_eq!(changed, 1);
    }

    let (start, end) = full_range();
    let report = client.validate_events(&stream, start, end).await.unwrap();

    assert_eq!(report.total, 10);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failed[0].id, committed[4].id);
    assert_eq!(report.failed[0].reason, FailureReason::DigestMismatch);
    // The successor still names event 5's original digest, which no
    // longer matches the recomputed one.
    assert_eq!(report.failed[1].id, committed[5].id);
    assert_eq!(report.failed[1].reason, FailureReason::ChainBreak);
    assert_eq!(report.verified, 8);

    client.close().await.unwrap();
}

#[tokio::test]
async fn update_through_the_store_fails_while_triggers_stand() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let db_path = config.store.path.clone();
    let client = AuditClient::open(config).await.unwrap();
    let stream = StreamKey::new("P", "E");

    let event = client
        .create_event(&stream, submission("user.create", Crud::Create, "u1"))
        .await
        .unwrap();

    let raw = rusqlite::Connection::open(&db_path).unwrap();
    let err = raw
        .execute(
            "UPDATE audit_events SET description = 'x' WHERE id = ?1",
            [event.id.to_string()],
        )
        .unwrap_err();
    assert!(err.to_string().contains("immutable"));

    // Digests recomputed at any time still match the stored ones.
    let (start, end) = full_range();
    let report = client.validate_events(&stream, start, end).await.unwrap();
    assert!(report.is_clean());

    client.close().await.unwrap();
}

#[tokio::test]
async fn verification_tolerates_growth_past_the_range_end() {
    let dir = TempDir::new().unwrap();
    let client = AuditClient::open(test_config(dir.path())).await.unwrap();
    let stream = StreamKey::new("P", "E");

    for n in 0..3 {
        client
            .create_event(&stream, submission(&format!("a.b{n}"), Crud::Create, "u1"))
            .await
            .unwrap();
    }
    let mid = Utc::now();
    for n in 3..6 {
        client
            .create_event(&stream, submission(&format!("a.b{n}"), Crud::Create, "u1"))
            .await
            .unwrap();
    }

    // Validate only the prefix while the chain has grown past `end`.
    let report = client
        .validate_events(&stream, DateTime::UNIX_EPOCH, mid)
        .await
        .unwrap();
    assert_eq!(report.total, 3);
    assert!(report.is_clean());

    client.close().await.unwrap();
}

#[tokio::test]
async fn validate_on_query_rejects_tampered_pages() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.integrity.validate_on_query = true;
    let db_path = config.store.path.clone();
    let client = AuditClient::open(config).await.unwrap();
    let stream = StreamKey::new("P", "E");

    let event = client
        .create_event(&stream, submission("user.create", Crud::Create, "u1"))
        .await
        .unwrap();

    // Clean page passes.
    let page = client
        .query_events(&stream, EventFilter::new())
        .await
        .unwrap();
    assert_eq!(page.events.len(), 1);

    {
        let raw = rusqlite::Connection::open(&db_path).unwrap();
        raw.execute("DROP TRIGGER audit_events_immutable_update", [])
            .unwrap();
        raw.execute(
            "UPDATE audit_events SET action = 'user.delete' WHERE id = ?1",
            [event.id.to_string()],
        )
        .unwrap();
    }

    let err = client
        .query_events(&stream, EventFilter::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AthanorError::Integrity(_)));

    client.close().await.unwrap();
}
