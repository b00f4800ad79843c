//! Keeps the render-ready projection in step with the store.
//!
//! Runs on its own tokio task so rebuilding never holds up store writes.
//! Change events already queued when one arrives are merged into it; for
//! each merged batch the store is re-read, the projection rebuilt and diffed
//! against the previous one, and any non-empty result handed to the single
//! update consumer.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use shared::{
    change::ChangeEvent,
    domain::{display_order, Record, StorageHandle},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::{
    diff::{diff, EditScript, Keyed},
    error::{CoreError, StoreError},
    store::{ChangeStream, StoreSnapshot, TransactionalStore},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectedRow {
    pub handle: StorageHandle,
    pub record: Record,
    pub is_editing: bool,
}

// Keyed by storage handle: the id changes when a pending record is confirmed.
impl Keyed for ProjectedRow {
    type Key = StorageHandle;

    fn key(&self) -> StorageHandle {
        self.handle
    }
}

/// Builds the ordered projection from a store snapshot.
pub fn project(snapshot: &StoreSnapshot) -> Vec<ProjectedRow> {
    let mut records: Vec<&Record> = snapshot.records.iter().collect();
    records.sort_by(|a, b| display_order(a, b));
    records
        .into_iter()
        .filter_map(|record| {
            let handle = record.storage_handle?;
            Some(ProjectedRow {
                handle,
                record: record.clone(),
                is_editing: snapshot.editing == Some(handle),
            })
        })
        .collect()
}

/// The current projection. Readers clone the `Arc` under the lock and render
/// from that; the lock is never held across a render.
#[derive(Clone, Default)]
pub struct SharedProjection {
    rows: Arc<RwLock<Arc<Vec<ProjectedRow>>>>,
}

impl SharedProjection {
    pub fn snapshot(&self) -> Arc<Vec<ProjectedRow>> {
        self.rows.read().clone()
    }

    fn replace(&self, rows: Arc<Vec<ProjectedRow>>) {
        *self.rows.write() = rows;
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionUpdate {
    pub projection: Arc<Vec<ProjectedRow>>,
    pub script: EditScript,
}

/// Projection updates in the order they were computed.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<ProjectionUpdate>,
}

impl UpdateStream {
    pub async fn recv(&mut self) -> Option<ProjectionUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProjectionUpdate> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<ProjectionUpdate> {
        UnboundedReceiverStream::new(self.rx)
    }
}

enum Control {
    Sync(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Reconciler {
    control: mpsc::UnboundedSender<Control>,
    projection: SharedProjection,
}

impl Reconciler {
    /// Loads the initial projection, then starts following `changes`. The
    /// initial load produces no update.
    pub async fn spawn(
        store: TransactionalStore,
        changes: ChangeStream,
    ) -> Result<(Self, UpdateStream), StoreError> {
        let initial = project(&store.snapshot().await?);
        debug!(rows = initial.len(), "initial projection loaded");

        let projection = SharedProjection::default();
        projection.replace(Arc::new(initial));
        let (control, control_rx) = mpsc::unbounded_channel();
        let (updates, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            store,
            projection: projection.clone(),
            updates,
        };
        tokio::spawn(worker.run(changes, control_rx));

        Ok((
            Self {
                control,
                projection,
            },
            UpdateStream { rx },
        ))
    }

    pub fn projection(&self) -> Arc<Vec<ProjectedRow>> {
        self.projection.snapshot()
    }

    pub fn shared(&self) -> SharedProjection {
        self.projection.clone()
    }

    /// Resolves once every change event already delivered has been reconciled.
    pub async fn sync(&self) -> Result<(), CoreError> {
        self.request(Control::Sync).await
    }

    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.request(Control::Shutdown).await
    }

    async fn request(
        &self,
        message: impl FnOnce(oneshot::Sender<()>) -> Control,
    ) -> Result<(), CoreError> {
        let (reply, done) = oneshot::channel();
        self.control
            .send(message(reply))
            .map_err(|_| CoreError::ReconcilerClosed)?;
        done.await.map_err(|_| CoreError::ReconcilerClosed)
    }
}

struct Worker {
    store: TransactionalStore,
    projection: SharedProjection,
    updates: mpsc::UnboundedSender<ProjectionUpdate>,
}

impl Worker {
    async fn run(self, mut changes: ChangeStream, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut store_open = true;
        loop {
            tokio::select! {
                biased;

                change = changes.recv(), if store_open => match change {
                    Some(change) => self.reconcile(change, &mut changes).await,
                    None => {
                        debug!("change stream closed");
                        store_open = false;
                    }
                },
                message = control.recv() => match message {
                    Some(Control::Sync(reply)) => {
                        if let Some(change) = changes.try_recv() {
                            self.reconcile(change, &mut changes).await;
                        }
                        let _ = reply.send(());
                    }
                    Some(Control::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("reconciler stopped");
    }

    async fn reconcile(&self, mut change: ChangeEvent, changes: &mut ChangeStream) {
        let mut batched = 1;
        while let Some(next) = changes.try_recv() {
            change.merge(next);
            batched += 1;
        }
        debug!(events = batched, handles = change.len(), "reconciling committed changes");
        self.rebuild().await;
    }

    async fn rebuild(&self) {
        let snapshot = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "could not read store; keeping previous projection");
                return;
            }
        };
        let next = project(&snapshot);
        let previous = self.projection.snapshot();
        let script = diff(&previous, &next);
        if script.is_empty() {
            debug!("projection unchanged");
            return;
        }

        debug!(
            rows = next.len(),
            removed = script.removed.len(),
            inserted = script.inserted.len(),
            moved = script.moved.len(),
            updated = script.updated.len(),
            "projection rebuilt"
        );
        let next = Arc::new(next);
        self.projection.replace(Arc::clone(&next));
        if self
            .updates
            .send(ProjectionUpdate {
                projection: next,
                script,
            })
            .is_err()
        {
            debug!("no update consumer attached");
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
