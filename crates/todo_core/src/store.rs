//! The sole writer of persisted records.
//!
//! A single tokio task owns the storage connection and the transient
//! "currently editing" marker. Reads and writes arrive as messages on one
//! inbox and are handled strictly in arrival order, so no two transactions
//! interleave and no reader sees a partial write.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::{
    action::Action,
    change::ChangeEvent,
    domain::{Record, RecordId, StorageHandle},
    error::{RemoteError, RemoteErrorCode},
};
use storage::{Storage, WriteTransaction};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{BusHandle, Round, Token},
    error::StoreError,
    remote::RemoteService,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Rows stay in storage flagged `soft_deleted` until purged.
    #[default]
    Soft,
    Hard,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub delete_mode: DeleteMode,
}

/// Point-in-time view of the store: live records plus the editing marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub records: Vec<Record>,
    pub editing: Option<StorageHandle>,
}

impl StoreSnapshot {
    pub fn editing_id(&self) -> Option<RecordId> {
        let editing = self.editing?;
        self.records
            .iter()
            .find(|r| r.storage_handle == Some(editing))
            .map(|r| r.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotice {
    /// A transaction was rejected by storage and rolled back.
    TransactionFailed { action: &'static str, message: String },
}

enum StoreMessage {
    Handle(Action),
    GetAll(oneshot::Sender<Result<Vec<Record>, StoreError>>),
    Snapshot(oneshot::Sender<Result<StoreSnapshot, StoreError>>),
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Committed change events, in commit order, for exactly one consumer.
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct TransactionalStore {
    inbox: mpsc::UnboundedSender<StoreMessage>,
    notices: broadcast::Sender<StoreNotice>,
}

impl TransactionalStore {
    /// Starts the store task on the current tokio runtime.
    pub fn spawn(
        storage: Storage,
        remote: Arc<dyn RemoteService>,
        bus: BusHandle<Action>,
        options: StoreOptions,
    ) -> (Self, ChangeStream) {
        let (inbox, messages) = mpsc::unbounded_channel();
        let (changes, rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(64);

        let actor = StoreActor {
            storage,
            remote,
            bus,
            options,
            editing: None,
            changes,
            notices: notices.clone(),
        };
        tokio::spawn(actor.run(messages));

        (Self { inbox, notices }, ChangeStream { rx })
    }

    /// Registers this store as a listener on `bus`.
    pub fn register(&self, bus: &BusHandle<Action>) -> Token {
        let store = self.clone();
        bus.register(move |action: &Action, _round: &Round<'_, Action>| {
            store.handle(action.clone());
            Ok(())
        })
    }

    /// Queues `action` for the store task. Never blocks.
    pub fn handle(&self, action: Action) {
        if self.inbox.send(StoreMessage::Handle(action)).is_err() {
            warn!("store task is gone; dropping action");
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Record>, StoreError> {
        self.request(StoreMessage::GetAll).await?
    }

    /// Blocking variant of [`get_all`](Self::get_all) for callers outside
    /// the async runtime. Must not be called from a bus listener.
    pub fn get_all_blocking(&self) -> Result<Vec<Record>, StoreError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(StoreMessage::GetAll(reply))
            .map_err(|_| StoreError::Closed)?;
        response.blocking_recv().map_err(|_| StoreError::Closed)?
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        self.request(StoreMessage::Snapshot).await?
    }

    /// Resolves once every message queued before it has been handled and
    /// its change event, if any, published.
    pub async fn sync(&self) -> Result<(), StoreError> {
        self.request(StoreMessage::Sync).await
    }

    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.request(StoreMessage::Shutdown).await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<StoreNotice> {
        self.notices.subscribe()
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> StoreMessage,
    ) -> Result<T, StoreError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(message(reply))
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)
    }
}

/// What a handled action did.
enum Outcome {
    /// Nothing observable changed; no event goes out.
    Unchanged,
    Committed(ChangeEvent),
}

struct StoreActor {
    storage: Storage,
    remote: Arc<dyn RemoteService>,
    bus: BusHandle<Action>,
    options: StoreOptions,
    editing: Option<StorageHandle>,
    changes: mpsc::UnboundedSender<ChangeEvent>,
    notices: broadcast::Sender<StoreNotice>,
}

impl StoreActor {
    async fn run(mut self, mut messages: mpsc::UnboundedReceiver<StoreMessage>) {
        while let Some(message) = messages.recv().await {
            match message {
                StoreMessage::Handle(action) => self.handle(action).await,
                StoreMessage::GetAll(reply) => {
                    let records = self.storage.list_live_records().await;
                    let _ = reply.send(records.map_err(StoreError::from));
                }
                StoreMessage::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot().await.map_err(StoreError::from));
                }
                StoreMessage::Sync(reply) => {
                    let _ = reply.send(());
                }
                StoreMessage::Shutdown(reply) => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("store task stopped");
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        let records = self.storage.list_live_records().await?;
        Ok(StoreSnapshot {
            records,
            editing: self.editing,
        })
    }

    async fn handle(&mut self, action: Action) {
        let name = action.name();
        let target = action.target().map(|id| id.0);
        match self.apply(action).await {
            Ok(Outcome::Unchanged) => {
                debug!(action = name, ?target, "action left the store unchanged");
            }
            Ok(Outcome::Committed(change)) => {
                debug!(
                    action = name,
                    ?target,
                    inserted = ?change.inserted,
                    updated = ?change.updated,
                    deleted = ?change.deleted,
                    "transaction committed"
                );
                if self.changes.send(change).is_err() {
                    debug!("no change consumer attached");
                }
            }
            Err(err) => {
                error!(action = name, ?target, error = %err, "transaction rolled back");
                let _ = self.notices.send(StoreNotice::TransactionFailed {
                    action: name,
                    message: format!("{err:#}"),
                });
            }
        }
    }

    async fn apply(&mut self, action: Action) -> Result<Outcome> {
        match action {
            Action::Create => self.create().await,
            Action::BeginEditTitle { id } => self.begin_edit(id).await,
            Action::UpdateTitle { id, text } => self.update_title(id, text).await,
            Action::Delete { id } => self.delete(id).await,
            Action::SetCompleted { id, completed } => self.set_completed(id, completed).await,
            Action::DeleteAllCompleted => self.delete_all_completed().await,
            Action::RemoteCreateSucceeded { temp_id, confirmed } => {
                self.confirm_create(temp_id, confirmed).await
            }
            Action::RemoteCreateFailed { temp_id, error } => {
                self.roll_back_create(temp_id, error).await
            }
        }
    }

    async fn create(&mut self) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = insert_pending(&mut tx).await;
        let ((temp_id, handle), change) = finish(tx, body).await?;

        self.editing = Some(handle);
        info!(temp_id = temp_id.0, handle = handle.0, "created pending record");
        self.request_confirmation(temp_id);
        Ok(Outcome::Committed(change))
    }

    async fn begin_edit(&mut self, id: RecordId) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = tx.find_by_id(id).await;
        let (found, _) = finish(tx, body).await?;

        let Some(handle) = found.and_then(|r| r.storage_handle) else {
            debug!(id = id.0, "begin edit targets a record that no longer exists");
            return Ok(Outcome::Unchanged);
        };
        if self.editing == Some(handle) {
            return Ok(Outcome::Unchanged);
        }
        self.editing = Some(handle);
        Ok(Outcome::Committed(ChangeEvent::default()))
    }

    async fn update_title(&mut self, id: RecordId, text: String) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = rewrite(&mut tx, id, |record| record.title = Some(text)).await;
        let (rewritten, change) = finish(tx, body).await?;

        let Some(record) = rewritten else {
            debug!(id = id.0, "title update targets a record that no longer exists");
            return Ok(Outcome::Unchanged);
        };
        let ended_edit = self.editing.is_some() && self.editing == record.storage_handle;
        if ended_edit {
            self.editing = None;
        }
        if !change.is_empty() && !record.is_pending() {
            self.mirror_title(record.id, record.title.clone());
        }
        Ok(committed_if(change, ended_edit))
    }

    async fn set_completed(&mut self, id: RecordId, completed: bool) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = rewrite(&mut tx, id, |record| record.completed = completed).await;
        let (rewritten, change) = finish(tx, body).await?;

        let Some(record) = rewritten else {
            debug!(id = id.0, "completion targets a record that no longer exists");
            return Ok(Outcome::Unchanged);
        };
        if !change.is_empty() && !record.is_pending() {
            self.mirror_completed(record.id, completed);
        }
        Ok(committed_if(change, false))
    }

    async fn delete(&mut self, id: RecordId) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = remove_unless_editing(&mut tx, id, self.editing, self.options.delete_mode).await;
        let (removed, change) = finish(tx, body).await?;

        if let Some(record) = &removed {
            if !record.is_pending() {
                self.mirror_delete(record.id);
            }
        }
        Ok(committed_if(change, false))
    }

    async fn delete_all_completed(&mut self) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = remove_completed(&mut tx, self.editing, self.options.delete_mode).await;
        let (removed, change) = finish(tx, body).await?;

        for id in removed.into_iter().filter(|id| !id.is_pending()) {
            self.mirror_delete(id);
        }
        Ok(committed_if(change, false))
    }

    async fn confirm_create(&mut self, temp_id: RecordId, confirmed: Record) -> Result<Outcome> {
        let confirmed_id = confirmed.id;
        // A confirmed id must be positive; anything else would still read as pending.
        if confirmed_id.0 <= 0 {
            warn!(
                temp_id = temp_id.0,
                id = confirmed_id.0,
                "remote confirmed a record with an invalid id"
            );
            let error = RemoteError::new(
                RemoteErrorCode::Internal,
                format!("confirmed id {confirmed_id} is not a positive id"),
            );
            return self.roll_back_create(temp_id, error).await;
        }
        let mut tx = self.storage.begin().await?;
        let body = rewrite(&mut tx, temp_id, |record| record.id = confirmed_id).await;
        let (rewritten, change) = finish(tx, body).await?;

        let Some(record) = rewritten else {
            debug!(
                temp_id = temp_id.0,
                "confirmation arrived for a record that is already gone"
            );
            return Ok(Outcome::Unchanged);
        };
        info!(
            temp_id = temp_id.0,
            id = confirmed_id.0,
            "pending record confirmed"
        );
        // Local edits made while the record was pending still have to reach the remote.
        if record.title != confirmed.title {
            self.mirror_title(record.id, record.title.clone());
        }
        if record.completed != confirmed.completed {
            self.mirror_completed(record.id, record.completed);
        }
        Ok(committed_if(change, false))
    }

    async fn roll_back_create(&mut self, temp_id: RecordId, error: RemoteError) -> Result<Outcome> {
        let mut tx = self.storage.begin().await?;
        let body = drop_pending(&mut tx, temp_id).await;
        let (dropped, change) = finish(tx, body).await?;

        let Some(handle) = dropped else {
            debug!(
                temp_id = temp_id.0,
                "rejection arrived for a record that is already gone"
            );
            return Ok(Outcome::Unchanged);
        };
        warn!(temp_id = temp_id.0, error = %error, "remote rejected pending record; removed");
        let ended_edit = self.editing == Some(handle);
        if ended_edit {
            self.editing = None;
        }
        Ok(committed_if(change, ended_edit))
    }

    fn request_confirmation(&self, temp_id: RecordId) {
        let remote = Arc::clone(&self.remote);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let action = match remote.create(temp_id).await {
                Ok(confirmed) => Action::RemoteCreateSucceeded { temp_id, confirmed },
                Err(error) => Action::RemoteCreateFailed { temp_id, error },
            };
            if let Err(err) = bus.dispatch(action) {
                warn!(temp_id = temp_id.0, error = %err, "could not deliver remote confirmation");
            }
        });
    }

    fn mirror_title(&self, id: RecordId, title: Option<String>) {
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            if let Err(err) = remote.update_title(id, title).await {
                warn!(id = id.0, error = %err, "remote title update failed");
            }
        });
    }

    fn mirror_completed(&self, id: RecordId, completed: bool) {
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            if let Err(err) = remote.set_completed(id, completed).await {
                warn!(id = id.0, error = %err, "remote completion update failed");
            }
        });
    }

    fn mirror_delete(&self, id: RecordId) {
        let remote = Arc::clone(&self.remote);
        tokio::spawn(async move {
            if let Err(err) = remote.delete(id).await {
                warn!(id = id.0, error = %err, "remote delete failed");
            }
        });
    }
}

/// Commits on success, rolls back on failure. The transaction never
/// outlives this call.
async fn finish<T>(tx: WriteTransaction, body: Result<T>) -> Result<(T, ChangeEvent)> {
    match body {
        Ok(value) => {
            let change = tx.commit().await?;
            Ok((value, change))
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

fn committed_if(change: ChangeEvent, transient_changed: bool) -> Outcome {
    if change.is_empty() && !transient_changed {
        Outcome::Unchanged
    } else {
        Outcome::Committed(change)
    }
}

async fn insert_pending(tx: &mut WriteTransaction) -> Result<(RecordId, StorageHandle)> {
    let temp_id = tx.next_temporary_id().await?;
    let handle = tx.insert_record(&Record::pending(temp_id)).await?;
    Ok((temp_id, handle))
}

/// Applies `edit` to the live record carrying `id` and writes it back.
/// Returns the edited record, or `None` when no such record exists.
async fn rewrite(
    tx: &mut WriteTransaction,
    id: RecordId,
    edit: impl FnOnce(&mut Record),
) -> Result<Option<Record>> {
    let Some(mut record) = tx.find_by_id(id).await? else {
        return Ok(None);
    };
    let Some(handle) = record.storage_handle else {
        return Ok(None);
    };
    edit(&mut record);
    tx.update_record(handle, &record).await?;
    Ok(Some(record))
}

async fn remove_unless_editing(
    tx: &mut WriteTransaction,
    id: RecordId,
    editing: Option<StorageHandle>,
    mode: DeleteMode,
) -> Result<Option<Record>> {
    let Some(record) = tx.find_by_id(id).await? else {
        return Ok(None);
    };
    let Some(handle) = record.storage_handle else {
        return Ok(None);
    };
    if editing == Some(handle) {
        info!(id = id.0, "record is being edited; deletion deferred");
        return Ok(None);
    }
    remove(tx, handle, mode).await?;
    Ok(Some(record))
}

/// Removes every completed live record except the one being edited and
/// returns the ids removed.
async fn remove_completed(
    tx: &mut WriteTransaction,
    editing: Option<StorageHandle>,
    mode: DeleteMode,
) -> Result<Vec<RecordId>> {
    let mut removed = Vec::new();
    for record in tx.list_live().await? {
        let Some(handle) = record.storage_handle else {
            continue;
        };
        if !record.completed {
            continue;
        }
        if editing == Some(handle) {
            info!(id = record.id.0, "skipping completed record that is being edited");
            continue;
        }
        remove(tx, handle, mode).await?;
        removed.push(record.id);
    }
    Ok(removed)
}

async fn drop_pending(tx: &mut WriteTransaction, temp_id: RecordId) -> Result<Option<StorageHandle>> {
    let Some(record) = tx.find_by_id(temp_id).await? else {
        return Ok(None);
    };
    let Some(handle) = record.storage_handle else {
        return Ok(None);
    };
    tx.delete_record(handle).await?;
    Ok(Some(handle))
}

async fn remove(tx: &mut WriteTransaction, handle: StorageHandle, mode: DeleteMode) -> Result<()> {
    match mode {
        DeleteMode::Hard => tx.delete_record(handle).await?,
        DeleteMode::Soft => tx.soft_delete_record(handle).await?,
    };
    Ok(())
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
