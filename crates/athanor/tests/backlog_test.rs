//! Backlog replay: failed commits drain back into the chain in order.

mod common;

use athanor::{
    BacklogWorker, ChainEngine, IngestPipeline, SqliteEventStore, StreamLocks, Verifier,
};
use athanor::prelude::*;
use athanor_core::{BacklogConfig, CryptoConfig, CryptoService, IngestConfig};
use athanor_sqlite::store;
use common::{submission, PRIVATE_PEM, PUBLIC_PEM};
use std::sync::Arc;
use tempfile::TempDir;

struct Rig {
    store: Arc<SqliteEventStore>,
    crypto: Arc<CryptoService>,
    chain: Arc<ChainEngine>,
    pipeline: Arc<IngestPipeline>,
    _dir: TempDir,
}

fn rig() -> Rig {
    let dir = TempDir::new().unwrap();
    let store_config =
        athanor::StoreConfig::new(dir.path().join("audit.db")).with_pool_size(2);
    let store = Arc::new(SqliteEventStore::open(&store_config).unwrap());
    let crypto = Arc::new(
        CryptoService::from_config(&CryptoConfig::new(PRIVATE_PEM, PUBLIC_PEM)).unwrap(),
    );
    let locks = Arc::new(StreamLocks::with_stripes(64));
    let chain = Arc::new(ChainEngine::new(store.clone(), crypto.clone(), locks));
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        chain.clone(),
        IngestConfig::default(),
    ));
    Rig {
        store,
        crypto,
        chain,
        pipeline,
        _dir: dir,
    }
}

fn worker(rig: &Rig, config: BacklogConfig) -> BacklogWorker {
    BacklogWorker::new(rig.store.clone(), rig.chain.clone(), config)
}

#[test]
fn failed_commits_replay_in_accept_order() {
    let rig = rig();
    let stream = StreamKey::new("P", "E");

    // Two events commit normally.
    for n in 0..2 {
        let task = rig
            .pipeline
            .accept(&stream, submission(&format!("user.step{n}"), Crud::Update, "u1"))
            .unwrap();
        rig.pipeline.commit(&task).unwrap();
    }

    // Three accepts whose commit "failed" land in the backlog.
    let mut parked = Vec::new();
    for n in 2..5 {
        let task = rig
            .pipeline
            .accept(&stream, submission(&format!("user.step{n}"), Crud::Update, "u1"))
            .unwrap();
        rig.pipeline.fail_to_backlog(&task, "injected failure").unwrap();
        parked.push(task);
    }

    let events_before = rig
        .store
        .with_write(|conn| {
            store::events_in_range(
                conn,
                &stream,
                chrono::DateTime::UNIX_EPOCH,
                chrono::Utc::now() + chrono::Duration::days(1),
            )
        })
        .unwrap();
    assert_eq!(events_before.len(), 2);

    // One tick drains the whole stream group.
    let worker = worker(&rig, BacklogConfig::default());
    let stats = worker.run_tick().unwrap();
    assert_eq!(stats.replayed, 3);
    assert_eq!(stats.failed, 0);

    let events = rig
        .store
        .with_write(|conn| {
            store::events_in_range(
                conn,
                &stream,
                chrono::DateTime::UNIX_EPOCH,
                chrono::Utc::now() + chrono::Duration::days(1),
            )
        })
        .unwrap();
    assert_eq!(events.len(), 5);

    // Replay preserved accept order and the chain is intact.
    for (task, event) in parked.iter().zip(&events[2..]) {
        assert_eq!(task.new_event_id, event.id);
    }
    let report = Verifier::new(rig.crypto.clone()).verify_events(&events);
    assert!(report.is_clean(), "failures: {:?}", report.failed);

    // Replayed events took a fresh received_at but kept original intent.
    for (task, event) in parked.iter().zip(&events[2..]) {
        assert!(event.received_at >= task.received);
        assert_eq!(event.created_at, athanor_core::types::truncate_ms(&task.received));
    }

    // Nothing is left to do.
    assert!(rig
        .store
        .with_write(|c| store::fetch_backlog_batch(c, 10))
        .unwrap()
        .is_empty());
}

#[test]
fn replay_skips_rows_that_already_committed() {
    let rig = rig();
    let stream = StreamKey::new("P", "E");

    // Simulate a timed-out caller: the commit landed, but the error path
    // also parked the task.
    let task = rig
        .pipeline
        .accept(&stream, submission("user.create", Crud::Create, "u1"))
        .unwrap();
    rig.pipeline.commit(&task).unwrap();
    rig.pipeline.fail_to_backlog(&task, "deadline exceeded").unwrap();

    let worker = worker(&rig, BacklogConfig::default());
    let stats = worker.run_tick().unwrap();
    assert_eq!(stats.replayed, 1);

    // No duplicate row was appended.
    let report_events = rig
        .store
        .with_write(|conn| {
            store::events_in_range(
                conn,
                &stream,
                chrono::DateTime::UNIX_EPOCH,
                chrono::Utc::now() + chrono::Duration::days(1),
            )
        })
        .unwrap();
    assert_eq!(report_events.len(), 1);
}

#[test]
fn permanent_failures_are_dead_lettered_not_dropped() {
    let rig = rig();
    let stream = StreamKey::new("P", "E");

    // Commit an event holding the external id.
    let committed = rig
        .pipeline
        .accept(
            &stream,
            submission("user.create", Crud::Create, "u1").with_external_id("req-1"),
        )
        .unwrap();
    rig.pipeline.commit(&committed).unwrap();

    // Park a conflicting submission; replay hits the duplicate and the
    // row dead-letters immediately.
    let conflicting = rig
        .pipeline
        .accept(
            &stream,
            submission("user.create", Crud::Create, "u2").with_external_id("req-1"),
        )
        .unwrap();
    rig.pipeline
        .fail_to_backlog(&conflicting, "injected failure")
        .unwrap();

    let worker = worker(&rig, BacklogConfig::default());
    let stats = worker.run_tick().unwrap();
    assert_eq!(stats.dead_lettered, 1);

    // Dead rows are excluded from later ticks but still on disk.
    assert!(rig
        .store
        .with_write(|c| store::fetch_backlog_batch(c, 10))
        .unwrap()
        .is_empty());
    let dead: i64 = rig
        .store
        .with_write(|conn| {
            conn.query_row("SELECT COUNT(*) FROM backlog WHERE dead = 1", [], |row| {
                row.get(0)
            })
            .map_err(|e| AthanorError::Storage(e.to_string()))
        })
        .unwrap();
    assert_eq!(dead, 1);
}

#[test]
fn backoff_defers_recently_failed_rows_and_their_successors() {
    let rig = rig();
    let stream = StreamKey::new("P", "E");

    for n in 0..2 {
        let task = rig
            .pipeline
            .accept(&stream, submission(&format!("user.step{n}"), Crud::Update, "u1"))
            .unwrap();
        rig.pipeline.fail_to_backlog(&task, "injected failure").unwrap();
    }

    // Mark the first row as having just failed; with exponential backoff
    // it is not yet eligible, and the second row must wait behind it.
    let batch = rig
        .store
        .with_write(|c| store::fetch_backlog_batch(c, 10))
        .unwrap();
    rig.store
        .with_write(|c| store::bump_attempts(c, batch[0].id, "still failing"))
        .unwrap();

    let config = BacklogConfig {
        backoff_base_ms: 60_000,
        ..Default::default()
    };
    let worker = worker(&rig, config);
    let stats = worker.run_tick().unwrap();
    assert_eq!(stats.replayed, 0);
    assert_eq!(stats.deferred, 2);
}

#[test]
fn backlog_cap_surfaces_backlog_full() {
    let rig = rig();
    let stream = StreamKey::new("P", "E");

    let pipeline = IngestPipeline::new(
        rig.store.clone(),
        rig.chain.clone(),
        IngestConfig {
            max_backlog_per_stream: 1,
            ..Default::default()
        },
    );

    let first = pipeline
        .accept(&stream, submission("a.b", Crud::Create, "u1"))
        .unwrap();
    pipeline.fail_to_backlog(&first, "injected failure").unwrap();

    let second = pipeline
        .accept(&stream, submission("a.b", Crud::Create, "u1"))
        .unwrap();
    let err = pipeline
        .fail_to_backlog(&second, "injected failure")
        .unwrap_err();
    assert!(matches!(err, AthanorError::BacklogFull { depth: 1, .. }));
}
