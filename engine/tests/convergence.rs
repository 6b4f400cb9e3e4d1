//! End-to-end sync scenarios against the in-memory backend.

use cadence_engine::backend::{BackendOp, Tables};
use cadence_engine::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn schema() -> Schema {
    Schema::new(1)
        .with_collection(CollectionSchema::new(
            "groups",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("goal", FieldType::Int),
            ],
        ))
        .with_collection(CollectionSchema::new(
            "memberships",
            vec![
                FieldDef::required("group_id", FieldType::String),
                FieldDef::required("user_id", FieldType::String),
            ],
        ))
}

fn open(
    backend: Arc<MemoryBackend>,
    storage: Arc<dyn BlobStorage>,
    clock: Arc<ManualClock>,
) -> SyncEngine {
    SyncEngine::open_with_clock(schema(), storage, backend, SyncOptions::default(), clock)
        .unwrap()
}

fn live_options() -> SyncOptions {
    SyncOptions {
        backoff: Backoff {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
        },
        ..SyncOptions::default()
    }
}

fn open_live(backend: Arc<MemoryBackend>, storage: Arc<dyn BlobStorage>) -> SyncEngine {
    SyncEngine::open(schema(), storage, backend, live_options()).unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

fn group(id: &str, name: &str, updated_at: Timestamp) -> Record {
    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), json!(name));
    Record::new(id, fields, updated_at)
}

fn name_of(engine: &SyncEngine, id: &str) -> Option<Value> {
    engine
        .store()
        .get("groups", id)
        .and_then(|r| r.field("name").cloned())
}

// ============================================================================
// Offline create
// ============================================================================

#[tokio::test]
async fn offline_create_converges_to_exactly_one_row() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = open(backend.clone(), Arc::new(MemoryStorage::new()), clock.clone());
    backend.set_online(false);

    let write = engine.insert("groups", json!({"name": "Runners"})).unwrap();
    let id = write.record.id.clone();
    assert_eq!(name_of(&engine, &id), Some(json!("Runners")));

    // Offline: the push fails and is held back until its retry is due.
    assert_eq!(engine.flush_pending().await, 1);
    assert_eq!(engine.flush_pending().await, 0);
    let state = engine.sync_state("groups").unwrap();
    assert!(state.borrow().retrying);

    backend.set_online(true);
    clock.advance(1_000);
    assert_eq!(engine.flush_pending().await, 1);
    assert_eq!(write.confirmation.wait().await, Ok(Confirmed::Acknowledged));

    assert_eq!(backend.rows("groups").len(), 1);
    assert!(backend.row("groups", &id).is_some());
    assert_eq!(engine.pending_count(), 0);
    assert!(!state.borrow().retrying);
}

#[tokio::test]
async fn resent_create_does_not_duplicate() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = open(backend.clone(), Arc::new(MemoryStorage::new()), clock);

    let write = engine.insert("groups", json!({"name": "Runners"})).unwrap();
    // An earlier attempt reached the backend but its response was lost.
    backend.write_remote("groups", write.record.clone());

    engine.flush_pending().await;
    assert_eq!(write.confirmation.wait().await, Ok(Confirmed::Acknowledged));
    assert_eq!(backend.rows("groups").len(), 1);
}

// ============================================================================
// Durable replay
// ============================================================================

async fn replay_after_restart(storage: Arc<dyn BlobStorage>) {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1_000));

    let (kept, doomed) = {
        let engine = open(backend.clone(), storage.clone(), clock.clone());
        let kept = engine
            .insert("groups", json!({"name": "Runners"}))
            .unwrap()
            .record
            .id;
        clock.advance(10);
        engine.set("groups", &kept, json!({"goal": 5})).unwrap();
        let doomed = engine
            .insert("groups", json!({"name": "Typo"}))
            .unwrap()
            .record
            .id;
        clock.advance(10);
        engine.delete("groups", &doomed).unwrap();
        engine.sign_out().await;
        (kept, doomed)
    };
    assert_eq!(backend.upsert_count(), 0);

    clock.advance(60_000);
    let engine = open(backend.clone(), storage, clock);
    // Persisted state is visible before any network activity.
    assert_eq!(engine.store().get("groups", &kept).unwrap().field("goal"), Some(&json!(5)));
    assert!(engine.store().get("groups", &doomed).is_none());
    assert_eq!(engine.pending_count(), 2);

    assert_eq!(engine.flush_pending().await, 2);
    assert_eq!(engine.pending_count(), 0);

    let row = backend.row("groups", &kept).unwrap();
    assert!(row.is_active());
    assert_eq!(row.field("name"), Some(&json!("Runners")));
    assert_eq!(row.field("goal"), Some(&json!(5)));
    assert!(backend.row("groups", &doomed).unwrap().deleted);
    assert_eq!(backend.upsert_count(), 2);
}

#[tokio::test]
async fn offline_writes_replay_after_restart() {
    replay_after_restart(Arc::new(MemoryStorage::new())).await;
}

#[tokio::test]
async fn offline_writes_replay_after_restart_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    replay_after_restart(Arc::new(FileStorage::new(dir.path()).unwrap())).await;
}

#[tokio::test]
async fn sign_out_keeps_pending_work_and_refuses_writes() {
    let backend = Arc::new(MemoryBackend::new());
    let storage: Arc<dyn BlobStorage> = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::new(1_000));

    let engine = open(backend.clone(), storage.clone(), clock.clone());
    let write = engine.insert("groups", json!({"name": "Runners"})).unwrap();
    engine.sign_out().await;

    assert_eq!(write.confirmation.wait().await, Err(Error::SignedOut));
    assert!(matches!(
        engine.insert("groups", json!({"name": "Late"})),
        Err(Error::SignedOut)
    ));
    assert!(matches!(engine.start(), Err(Error::SignedOut)));
    drop(engine);

    let engine = open(backend, storage, clock);
    assert_eq!(engine.pending_count(), 1);
}

// ============================================================================
// Multi-device convergence
// ============================================================================

#[tokio::test]
async fn concurrent_updates_converge_to_the_later_write() {
    let backend = Arc::new(MemoryBackend::new());
    let clock_a = Arc::new(ManualClock::new(1_000));
    let clock_b = Arc::new(ManualClock::new(1_000));
    let a = open(backend.clone(), Arc::new(MemoryStorage::new()), clock_a.clone());
    let b = open(backend.clone(), Arc::new(MemoryStorage::new()), clock_b.clone());

    let id = a
        .insert("groups", json!({"name": "Original"}))
        .unwrap()
        .record
        .id;
    a.flush_pending().await;
    b.pull("groups").await.unwrap();
    assert_eq!(name_of(&b, &id), Some(json!("Original")));

    // T on device A, T+5s on device B. A reaches the backend last.
    clock_a.set(10_000);
    clock_b.set(15_000);
    a.set("groups", &id, json!({"name": "From A"})).unwrap();
    b.set("groups", &id, json!({"name": "From B"})).unwrap();
    b.flush_pending().await;
    a.flush_pending().await;
    a.pull("groups").await.unwrap();
    b.pull("groups").await.unwrap();

    assert_eq!(name_of(&a, &id), Some(json!("From B")));
    assert_eq!(name_of(&b, &id), Some(json!("From B")));
    assert_eq!(
        backend.row("groups", &id).unwrap().field("name"),
        Some(&json!("From B"))
    );
    assert_eq!(a.pending_count(), 0);
}

#[tokio::test]
async fn later_delete_beats_an_older_edit() {
    let backend = Arc::new(MemoryBackend::new());
    let clock_a = Arc::new(ManualClock::new(1_000));
    let clock_b = Arc::new(ManualClock::new(1_000));
    let a = open(backend.clone(), Arc::new(MemoryStorage::new()), clock_a.clone());
    let b = open(backend.clone(), Arc::new(MemoryStorage::new()), clock_b.clone());

    let id = a
        .insert("groups", json!({"name": "Runners"}))
        .unwrap()
        .record
        .id;
    a.flush_pending().await;
    b.pull("groups").await.unwrap();

    clock_a.set(20_000);
    clock_b.set(18_000);
    a.delete("groups", &id).unwrap();
    a.flush_pending().await;
    b.set("groups", &id, json!({"name": "Stale edit"})).unwrap();
    b.flush_pending().await;

    assert!(backend.row("groups", &id).unwrap().deleted);
    assert!(b.store().get("groups", &id).is_none());
    assert!(a.store().get("groups", &id).is_none());
}

#[tokio::test]
async fn queued_write_is_superseded_by_newer_remote_row() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = open(backend.clone(), Arc::new(MemoryStorage::new()), clock);

    let created = engine.insert("groups", json!({"name": "Runners"})).unwrap();
    let id = created.record.id.clone();
    engine.flush_pending().await;

    let edit = engine.set("groups", &id, json!({"name": "Mine"})).unwrap();
    let mut newer = edit.record.clone();
    newer.updated_at += 5_000;
    newer.fields.insert("name".into(), json!("Theirs"));
    backend.write_remote("groups", newer);

    engine.pull("groups").await.unwrap();
    assert_eq!(edit.confirmation.wait().await, Ok(Confirmed::Superseded));
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(name_of(&engine, &id), Some(json!("Theirs")));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn constraint_violation_reaches_the_caller_and_rolls_back() {
    let backend = Arc::new(MemoryBackend::new());
    backend.unique("groups", "name");
    let clock = Arc::new(ManualClock::new(1_000));
    let a = open(backend.clone(), Arc::new(MemoryStorage::new()), clock.clone());
    let b = open(backend.clone(), Arc::new(MemoryStorage::new()), clock);

    a.insert("groups", json!({"name": "Runners"})).unwrap();
    a.flush_pending().await;

    let write = b.insert("groups", json!({"name": "Runners"})).unwrap();
    let id = write.record.id.clone();
    b.flush_pending().await;

    match write.confirmation.wait().await {
        Err(Error::Rejected { kind, .. }) => assert_eq!(kind, BackendErrorKind::Constraint),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(b.store().get("groups", &id).is_none());
    assert_eq!(b.pending_count(), 0);
    assert_eq!(backend.rows("groups").len(), 1);

    let state = b.sync_state("groups").unwrap();
    assert_eq!(
        state.borrow().last_error.as_ref().map(|e| e.kind),
        Some(BackendErrorKind::Constraint)
    );
}

#[tokio::test]
async fn rejected_credential_pauses_until_reauthenticated() {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let engine = open(backend.clone(), Arc::new(MemoryStorage::new()), clock);
    let mut session = engine.session_events();

    backend.inject_failure(BackendOp::Upsert, BackendErrorKind::Authorization);
    let write = engine.insert("groups", json!({"name": "Runners"})).unwrap();
    engine.flush_pending().await;

    assert!(matches!(
        session.recv().await,
        Ok(SessionEvent::Invalidated { .. })
    ));
    assert_eq!(engine.pending_count(), 1);
    assert_eq!(engine.flush_pending().await, 0);

    engine.reauthenticated();
    assert_eq!(session.recv().await, Ok(SessionEvent::Resumed));
    assert_eq!(engine.flush_pending().await, 1);
    assert_eq!(write.confirmation.wait().await, Ok(Confirmed::Acknowledged));
}

#[tokio::test]
async fn persistence_failure_is_not_fatal() {
    let backend = Arc::new(MemoryBackend::new());
    let storage = MemoryStorage::new();
    storage.set_fail_writes(true);
    let engine = open(
        backend.clone(),
        Arc::new(storage),
        Arc::new(ManualClock::new(1_000)),
    );

    let write = engine.insert("groups", json!({"name": "Runners"})).unwrap();
    engine.flush_pending().await;
    assert_eq!(write.confirmation.wait().await, Ok(Confirmed::Acknowledged));
    assert_eq!(backend.rows("groups").len(), 1);

    engine.sign_out().await;
    assert!(!engine.is_persistence_healthy());
}

// ============================================================================
// Remote procedures
// ============================================================================

fn register_procedures(backend: &MemoryBackend) {
    backend.register_procedure("accept_invitation", |tables: &mut Tables, params: Value| {
        let group_id = params["group_id"].as_str().unwrap_or_default().to_string();
        let user_id = params["user_id"].as_str().unwrap_or_default().to_string();
        let group_exists = tables
            .get("groups")
            .and_then(|rows| rows.get(&group_id))
            .is_some_and(Record::is_active);
        if !group_exists {
            return Err(BackendError::new(
                BackendErrorKind::Validation,
                "no such group",
            ));
        }

        let mut fields = serde_json::Map::new();
        fields.insert("group_id".into(), json!(group_id));
        fields.insert("user_id".into(), json!(user_id));
        let membership = Record::new(format!("{group_id}:{user_id}"), fields, 50_000);
        tables
            .entry("memberships".into())
            .or_default()
            .insert(membership.id.clone(), membership);
        Ok(json!({"accepted": true}))
    });

    backend.register_procedure("leaderboard", |tables: &mut Tables, _params: Value| {
        let groups = tables
            .get("groups")
            .map(|rows| rows.values().filter(|r| r.is_active()).count())
            .unwrap_or(0);
        Ok(json!({"groups": groups}))
    });
}

#[tokio::test]
async fn procedures_run_online_and_classify_errors() {
    let backend = Arc::new(MemoryBackend::new());
    register_procedures(&backend);
    let engine = open(
        backend.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(ManualClock::new(1_000)),
    );

    let group = engine
        .insert("groups", json!({"name": "Runners"}))
        .unwrap()
        .record
        .id;
    engine.flush_pending().await;

    let result = engine
        .call("accept_invitation", json!({"group_id": group, "user_id": "u-1"}))
        .await
        .unwrap();
    assert_eq!(result, json!({"accepted": true}));

    engine.pull("memberships").await.unwrap();
    assert_eq!(engine.store().get_all("memberships").unwrap().len(), 1);

    let missing = engine
        .call("accept_invitation", json!({"group_id": "nope", "user_id": "u-1"}))
        .await;
    assert!(matches!(
        missing,
        Err(Error::Rejected {
            kind: BackendErrorKind::Validation,
            ..
        })
    ));
    assert_eq!(backend.rows("memberships").len(), 1);

    backend.set_online(false);
    let offline = engine.call("leaderboard", json!({})).await;
    assert!(matches!(offline, Err(Error::Backend(_))));
    // Procedures are never queued.
    assert_eq!(engine.pending_count(), 0);
}

#[tokio::test]
async fn aggregate_view_refreshes_from_a_procedure() {
    let backend = Arc::new(MemoryBackend::new());
    register_procedures(&backend);
    let engine = open(
        backend.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(ManualClock::new(1_000)),
    );

    let view = engine.aggregate_view("leaderboard", json!({}), Duration::from_secs(30));
    view.refresh().await;
    assert_eq!(view.state().data().map(|d| (**d).clone()), Some(json!({"groups": 0})));

    engine.insert("groups", json!({"name": "Runners"})).unwrap();
    engine.flush_pending().await;
    view.refresh().await;
    assert_eq!(view.state().data().map(|d| (**d).clone()), Some(json!({"groups": 1})));
    assert_eq!(view.fetch_count(), 2);
}

// ============================================================================
// Live sync
// ============================================================================

#[tokio::test]
async fn live_feed_carries_writes_between_devices() {
    let backend = Arc::new(MemoryBackend::new());
    let a = open_live(backend.clone(), Arc::new(MemoryStorage::new()));
    let b = open_live(backend.clone(), Arc::new(MemoryStorage::new()));
    a.start().unwrap();
    b.start().unwrap();

    let a_state = a.sync_state("groups").unwrap();
    let b_state = b.sync_state("groups").unwrap();
    eventually("initial pulls", || {
        a_state.borrow().is_loaded && b_state.borrow().is_loaded
    })
    .await;

    let id = a
        .insert("groups", json!({"name": "Runners"}))
        .unwrap()
        .record
        .id;
    eventually("create reaches B", || name_of(&b, &id).is_some()).await;

    b.set("groups", &id, json!({"goal": 10})).unwrap();
    eventually("update reaches A", || {
        a.store().get("groups", &id).and_then(|r| r.field("goal").cloned()) == Some(json!(10))
    })
    .await;

    b.delete("groups", &id).unwrap();
    eventually("delete reaches A", || a.store().get("groups", &id).is_none()).await;

    a.sign_out().await;
    b.sign_out().await;
}

#[tokio::test]
async fn sync_resumes_after_an_outage() {
    let backend = Arc::new(MemoryBackend::new());
    let a = open_live(backend.clone(), Arc::new(MemoryStorage::new()));
    let b = open_live(backend.clone(), Arc::new(MemoryStorage::new()));
    a.start().unwrap();
    b.start().unwrap();

    let b_state = b.sync_state("groups").unwrap();
    eventually("initial pull", || b_state.borrow().is_loaded).await;

    backend.set_online(false);
    let id = a
        .insert("groups", json!({"name": "Written offline"}))
        .unwrap()
        .record
        .id;
    eventually("feed loss is reported", || {
        b_state.borrow().last_error.is_some()
    })
    .await;
    assert!(backend.row("groups", &id).is_none());

    backend.set_online(true);
    eventually("push drains", || backend.row("groups", &id).is_some()).await;
    eventually("B catches up", || name_of(&b, &id).is_some()).await;
    eventually("no pending work", || a.pending_count() == 0).await;

    a.sign_out().await;
    b.sign_out().await;
}

#[tokio::test]
async fn catch_up_receives_rows_stamped_before_the_last_pull() {
    let backend = Arc::new(MemoryBackend::new());
    let fast = open(
        backend.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(ManualClock::new(90_000)),
    );
    let slow = open(
        backend.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(ManualClock::new(1_000)),
    );
    let reader = open(
        backend.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(ManualClock::new(50_000)),
    );

    // Written while the slow device is offline; nothing is pushed yet.
    let early = slow
        .insert("groups", json!({"name": "Stamped early"}))
        .unwrap()
        .record
        .id;

    fast.insert("groups", json!({"name": "Stamped late"})).unwrap();
    assert_eq!(fast.flush_pending().await, 1);
    assert_eq!(reader.pull("groups").await.unwrap(), 1);

    // The slow device reconnects and pushes a row older than anything the
    // reader has seen.
    assert_eq!(slow.flush_pending().await, 1);
    assert!(backend.row("groups", &early).is_some());

    assert_eq!(reader.pull("groups").await.unwrap(), 1);
    assert_eq!(name_of(&reader, &early), Some(json!("Stamped early")));
    assert_eq!(reader.store().get_all("groups").unwrap().len(), 2);
}

#[tokio::test]
async fn rows_pushed_during_a_feed_outage_arrive_after_reconnect() {
    let backend = Arc::new(MemoryBackend::new());
    let now = SystemClock.now();
    backend.write_remote("groups", group("g-ahead", "Clock runs ahead", now + 60_000));

    let reader = open_live(backend.clone(), Arc::new(MemoryStorage::new()));
    reader.start().unwrap();
    let state = reader.sync_state("groups").unwrap();
    eventually("initial pull", || {
        state.borrow().is_loaded && name_of(&reader, "g-ahead").is_some()
    })
    .await;

    backend.set_online(false);
    eventually("feed loss is reported", || state.borrow().last_error.is_some()).await;

    // Another device reaches the backend while the reader is cut off, carrying
    // a row it wrote offline with an older stamp.
    backend.write_remote("groups", group("g-behind", "Written offline", now - 60_000));
    backend.write_remote("groups", group("g-ahead", "Edited remotely", now + 61_000));

    backend.set_online(true);
    eventually("old row arrives", || name_of(&reader, "g-behind").is_some()).await;
    eventually("edit arrives", || {
        name_of(&reader, "g-ahead") == Some(json!("Edited remotely"))
    })
    .await;
    eventually("reconnected", || state.borrow().last_error.is_none()).await;

    reader.sign_out().await;
}
