use std::time::Duration;

use shared::error::RemoteErrorCode;
use tokio::time::timeout;

use super::*;
use crate::{bus::ActionBus, remote::{ManualRemote, RemoteCall}};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    store: TransactionalStore,
    changes: ChangeStream,
    remote: Arc<ManualRemote>,
    storage: Storage,
    _bus: ActionBus<Action>,
}

async fn harness(delete_mode: DeleteMode) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let bus = ActionBus::new().expect("bus");
    let remote = Arc::new(ManualRemote::new());
    let (store, changes) = TransactionalStore::spawn(
        storage.clone(),
        remote.clone(),
        bus.handle(),
        StoreOptions { delete_mode },
    );
    store.register(&bus.handle());
    Harness {
        store,
        changes,
        remote,
        storage,
        _bus: bus,
    }
}

async fn next_change(changes: &mut ChangeStream) -> ChangeEvent {
    timeout(WAIT, changes.recv())
        .await
        .expect("change event in time")
        .expect("store running")
}

async fn assert_quiet(h: &mut Harness) {
    h.store.sync().await.expect("sync");
    assert_eq!(h.changes.try_recv(), None);
}

async fn create(h: &mut Harness) -> (RecordId, StorageHandle) {
    h.store.handle(Action::Create);
    let change = next_change(&mut h.changes).await;
    assert_eq!(change.inserted.len(), 1);
    let handle = *change.inserted.iter().next().expect("inserted handle");
    let record = h.storage.record(handle).await.expect("load").expect("row");
    (record.id, handle)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn create_inserts_pending_record_and_starts_editing() {
    let mut h = harness(DeleteMode::Soft).await;
    let (id, handle) = create(&mut h).await;

    assert_eq!(id, RecordId(-1));
    let snapshot = h.store.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.editing, Some(handle));
    assert_eq!(snapshot.editing_id(), Some(RecordId(-1)));
    assert_eq!(snapshot.records[0].title, None);
    assert!(!snapshot.records[0].completed);

    timeout(WAIT, h.remote.wait_for_create(id)).await.expect("create sent");
}

#[tokio::test]
async fn confirmation_rewrites_id_under_the_same_handle() {
    let mut h = harness(DeleteMode::Soft).await;
    let (temp_id, handle) = create(&mut h).await;
    timeout(WAIT, h.remote.wait_for_create(temp_id)).await.expect("create sent");

    assert!(h.remote.confirm(temp_id, Record::new(RecordId(1), None, false)));
    let change = next_change(&mut h.changes).await;

    assert!(change.inserted.is_empty());
    assert_eq!(change.updated.iter().copied().collect::<Vec<_>>(), vec![handle]);
    let snapshot = h.store.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.records[0].id, RecordId(1));
    assert_eq!(snapshot.records[0].storage_handle, Some(handle));
    assert_eq!(snapshot.editing_id(), Some(RecordId(1)));
}

#[tokio::test]
async fn edits_made_while_pending_reach_the_remote_after_confirmation() {
    let mut h = harness(DeleteMode::Soft).await;
    let (temp_id, _) = create(&mut h).await;
    h.store.handle(Action::UpdateTitle {
        id: temp_id,
        text: "milk".into(),
    });
    h.store.handle(Action::SetCompleted {
        id: temp_id,
        completed: true,
    });
    next_change(&mut h.changes).await;
    next_change(&mut h.changes).await;
    timeout(WAIT, h.remote.wait_for_create(temp_id)).await.expect("create sent");
    assert_eq!(h.remote.calls(), vec![RemoteCall::Create(temp_id)]);

    h.remote.confirm(temp_id, Record::new(RecordId(1), None, false));
    next_change(&mut h.changes).await;

    let remote = h.remote.clone();
    eventually("mirrored edits", || remote.calls().len() == 3).await;
    let calls = h.remote.calls();
    assert!(calls.contains(&RemoteCall::UpdateTitle(RecordId(1), Some("milk".into()))));
    assert!(calls.contains(&RemoteCall::SetCompleted(RecordId(1), true)));

    let records = h.store.get_all().await.expect("records");
    assert_eq!(records[0].title.as_deref(), Some("milk"));
    assert!(records[0].completed);
}

#[tokio::test]
async fn rejected_create_removes_the_record_and_ends_editing() {
    let mut h = harness(DeleteMode::Soft).await;
    let (temp_id, handle) = create(&mut h).await;
    timeout(WAIT, h.remote.wait_for_create(temp_id)).await.expect("create sent");

    h.remote.reject(
        temp_id,
        RemoteError::new(RemoteErrorCode::Rejected, "quota exceeded"),
    );
    let change = next_change(&mut h.changes).await;

    assert_eq!(change.deleted.iter().copied().collect::<Vec<_>>(), vec![handle]);
    let snapshot = h.store.snapshot().await.expect("snapshot");
    assert!(snapshot.records.is_empty());
    assert_eq!(snapshot.editing, None);
    assert_eq!(h.storage.record(handle).await.expect("load"), None);
}

#[tokio::test]
async fn confirmation_with_a_non_positive_id_rolls_back() {
    for bad in [RecordId(-7), RecordId(0)] {
        let mut h = harness(DeleteMode::Soft).await;
        let (temp_id, handle) = create(&mut h).await;
        timeout(WAIT, h.remote.wait_for_create(temp_id)).await.expect("create sent");

        assert!(h.remote.confirm(temp_id, Record::new(bad, None, false)));
        let change = next_change(&mut h.changes).await;

        assert_eq!(change.deleted.iter().copied().collect::<Vec<_>>(), vec![handle]);
        let snapshot = h.store.snapshot().await.expect("snapshot");
        assert!(snapshot.records.is_empty(), "id {bad} left a record behind");
        assert_eq!(snapshot.editing, None);
    }
}

#[tokio::test]
async fn begin_edit_emits_only_when_editing_moves() {
    let mut h = harness(DeleteMode::Soft).await;
    let (first, _) = create(&mut h).await;

    h.store.handle(Action::BeginEditTitle { id: first });
    assert_quiet(&mut h).await;

    let (_, second_handle) = create(&mut h).await;
    assert_eq!(
        h.store.snapshot().await.expect("snapshot").editing,
        Some(second_handle)
    );

    h.store.handle(Action::BeginEditTitle { id: first });
    let change = next_change(&mut h.changes).await;
    assert!(change.is_empty());
    assert_eq!(
        h.store.snapshot().await.expect("snapshot").editing_id(),
        Some(first)
    );
}

#[tokio::test]
async fn title_update_commits_and_ends_editing() {
    let mut h = harness(DeleteMode::Soft).await;
    let (id, handle) = create(&mut h).await;

    h.store.handle(Action::UpdateTitle {
        id,
        text: "buy bread".into(),
    });
    let change = next_change(&mut h.changes).await;

    assert!(change.updated.contains(&handle));
    let snapshot = h.store.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.editing, None);
    assert_eq!(snapshot.records[0].display_title(), "buy bread");
}

#[tokio::test]
async fn unchanged_values_emit_no_event() {
    let mut h = harness(DeleteMode::Soft).await;
    let (id, _) = create(&mut h).await;

    h.store.handle(Action::SetCompleted {
        id,
        completed: false,
    });
    assert_quiet(&mut h).await;
}

#[tokio::test]
async fn deleting_the_edited_record_is_deferred() {
    let mut h = harness(DeleteMode::Soft).await;
    let (editing, _) = create(&mut h).await;

    h.store.handle(Action::Delete { id: editing });
    assert_quiet(&mut h).await;
    assert_eq!(h.store.get_all().await.expect("records").len(), 1);
}

#[tokio::test]
async fn soft_delete_keeps_the_row_out_of_reads() {
    let mut h = harness(DeleteMode::Soft).await;
    let (doomed, handle) = create(&mut h).await;
    create(&mut h).await;

    h.store.handle(Action::Delete { id: doomed });
    let change = next_change(&mut h.changes).await;

    assert_eq!(change.deleted.iter().copied().collect::<Vec<_>>(), vec![handle]);
    assert!(change.updated.is_empty());
    let records = h.store.get_all().await.expect("records");
    assert!(records.iter().all(|r| r.id != doomed));
    let row = h.storage.record(handle).await.expect("load").expect("row kept");
    assert!(row.soft_deleted);
}

#[tokio::test]
async fn hard_delete_drops_the_row() {
    let mut h = harness(DeleteMode::Hard).await;
    let (doomed, handle) = create(&mut h).await;
    create(&mut h).await;

    h.store.handle(Action::Delete { id: doomed });
    let change = next_change(&mut h.changes).await;

    assert!(change.deleted.contains(&handle));
    assert_eq!(h.storage.record(handle).await.expect("load"), None);
}

#[tokio::test]
async fn delete_all_completed_skips_the_edited_record() {
    let mut h = harness(DeleteMode::Hard).await;
    let (done, done_handle) = create(&mut h).await;
    let (open, _) = create(&mut h).await;
    let (edited, _) = create(&mut h).await;
    for id in [done, edited] {
        h.store.handle(Action::SetCompleted {
            id,
            completed: true,
        });
        next_change(&mut h.changes).await;
    }

    h.store.handle(Action::DeleteAllCompleted);
    let change = next_change(&mut h.changes).await;

    assert_eq!(change.deleted.iter().copied().collect::<Vec<_>>(), vec![done_handle]);
    let ids: Vec<RecordId> = h
        .store
        .get_all()
        .await
        .expect("records")
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![open, edited]);
}

#[tokio::test]
async fn actions_on_missing_records_emit_no_event() {
    let mut h = harness(DeleteMode::Soft).await;
    create(&mut h).await;

    h.store.handle(Action::Delete { id: RecordId(42) });
    h.store.handle(Action::UpdateTitle {
        id: RecordId(42),
        text: "ghost".into(),
    });
    h.store.handle(Action::RemoteCreateSucceeded {
        temp_id: RecordId(-42),
        confirmed: Record::new(RecordId(42), None, false),
    });
    assert_quiet(&mut h).await;
}

#[tokio::test]
async fn storage_failure_rolls_back_and_reports() {
    let mut h = harness(DeleteMode::Soft).await;
    let (id, _) = create(&mut h).await;
    let mut notices = h.store.subscribe_notices();

    h.store.handle(Action::UpdateTitle {
        id,
        text: "x".repeat(storage::MAX_TITLE_LEN + 1),
    });
    assert_quiet(&mut h).await;

    let notice = notices.try_recv().expect("failure notice");
    assert!(matches!(
        notice,
        StoreNotice::TransactionFailed {
            action: "update_title",
            ..
        }
    ));
    let snapshot = h.store.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.records[0].title, None);
    assert!(snapshot.editing.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_reads_work_off_the_runtime() {
    let mut h = harness(DeleteMode::Soft).await;
    create(&mut h).await;

    let store = h.store.clone();
    let records = tokio::task::spawn_blocking(move || store.get_all_blocking())
        .await
        .expect("join")
        .expect("records");
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn requests_after_shutdown_report_closed() {
    let h = harness(DeleteMode::Soft).await;
    h.store.shutdown().await.expect("shutdown");

    assert!(matches!(h.store.get_all().await, Err(StoreError::Closed)));
    assert!(matches!(h.store.sync().await, Err(StoreError::Closed)));
}
