//! Contract with the remote authority that confirms records, plus the
//! collaborators used in place of a real network service.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use shared::{
    domain::{Record, RecordId},
    error::{RemoteError, RemoteErrorCode},
};
use tokio::sync::{oneshot, Notify};

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Confirms a pending record, returning it with its final id.
    async fn create(&self, temporary_id: RecordId) -> Result<Record, RemoteError>;
    async fn set_completed(&self, id: RecordId, completed: bool) -> Result<(), RemoteError>;
    async fn update_title(&self, id: RecordId, title: Option<String>) -> Result<(), RemoteError>;
    async fn delete(&self, id: RecordId) -> Result<(), RemoteError>;
}

/// Remote that is never reachable. Every pending record it sees is rolled back.
pub struct OfflineRemote;

#[async_trait]
impl RemoteService for OfflineRemote {
    async fn create(&self, _temporary_id: RecordId) -> Result<Record, RemoteError> {
        Err(RemoteError::unavailable("remote service is offline"))
    }

    async fn set_completed(&self, _id: RecordId, _completed: bool) -> Result<(), RemoteError> {
        Err(RemoteError::unavailable("remote service is offline"))
    }

    async fn update_title(&self, _id: RecordId, _title: Option<String>) -> Result<(), RemoteError> {
        Err(RemoteError::unavailable("remote service is offline"))
    }

    async fn delete(&self, _id: RecordId) -> Result<(), RemoteError> {
        Err(RemoteError::unavailable("remote service is offline"))
    }
}

/// In-process stand-in for the server: fixed latency, random failures, and
/// its own copy of the record list.
pub struct SimulatedRemote {
    delay: Duration,
    error_probability_percent: u32,
    records: Mutex<Vec<Record>>,
    in_flight: AtomicUsize,
}

impl SimulatedRemote {
    pub fn new(delay: Duration, error_probability_percent: u32) -> Self {
        Self {
            delay,
            error_probability_percent: error_probability_percent.min(100),
            records: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of requests currently waiting out their simulated latency.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    // The failure decision is made up front, the way a request is doomed
    // before it ever reaches the wire.
    async fn call<T>(&self, body: impl FnOnce(&mut Vec<Record>) -> T) -> Result<T, RemoteError> {
        let fails = rand::rng().random_range(0..100) < self.error_probability_percent;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let outcome = if fails {
            Err(RemoteError::unavailable("simulated network failure"))
        } else {
            Ok(body(&mut self.records.lock()))
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl RemoteService for SimulatedRemote {
    async fn create(&self, temporary_id: RecordId) -> Result<Record, RemoteError> {
        if !temporary_id.is_pending() {
            return Err(RemoteError::new(
                RemoteErrorCode::Rejected,
                format!("temporary id {temporary_id} is not negative"),
            ));
        }
        self.call(|records| {
            let confirmed = Record::new(temporary_id.confirmed_counterpart(), None, false);
            records.push(confirmed.clone());
            confirmed
        })
        .await
    }

    async fn set_completed(&self, id: RecordId, completed: bool) -> Result<(), RemoteError> {
        self.call(|records| {
            for record in records.iter_mut().filter(|r| r.id == id) {
                record.completed = completed;
            }
        })
        .await
    }

    async fn update_title(&self, id: RecordId, title: Option<String>) -> Result<(), RemoteError> {
        self.call(|records| {
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                record.title = title;
            }
        })
        .await
    }

    async fn delete(&self, id: RecordId) -> Result<(), RemoteError> {
        self.call(|records| records.retain(|r| r.id != id)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create(RecordId),
    SetCompleted(RecordId, bool),
    UpdateTitle(RecordId, Option<String>),
    Delete(RecordId),
}

/// Remote whose create confirmations are answered by hand. Other calls
/// succeed immediately. Every call is recorded.
#[derive(Default)]
pub struct ManualRemote {
    pending: Mutex<HashMap<RecordId, oneshot::Sender<Result<Record, RemoteError>>>>,
    calls: Mutex<Vec<RemoteCall>>,
    arrived: Notify,
}

impl ManualRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn pending_creates(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.pending.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Waits until a create request for `temporary_id` is outstanding.
    pub async fn wait_for_create(&self, temporary_id: RecordId) {
        loop {
            let arrived = self.arrived.notified();
            if self.pending.lock().contains_key(&temporary_id) {
                return;
            }
            arrived.await;
        }
    }

    /// Answers the outstanding create for `temporary_id`. Returns false if
    /// there was none.
    pub fn confirm(&self, temporary_id: RecordId, confirmed: Record) -> bool {
        self.answer(temporary_id, Ok(confirmed))
    }

    pub fn reject(&self, temporary_id: RecordId, error: RemoteError) -> bool {
        self.answer(temporary_id, Err(error))
    }

    fn answer(&self, temporary_id: RecordId, outcome: Result<Record, RemoteError>) -> bool {
        match self.pending.lock().remove(&temporary_id) {
            Some(reply) => reply.send(outcome).is_ok(),
            None => false,
        }
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl RemoteService for ManualRemote {
    async fn create(&self, temporary_id: RecordId) -> Result<Record, RemoteError> {
        let (reply, answer) = oneshot::channel();
        self.record(RemoteCall::Create(temporary_id));
        self.pending.lock().insert(temporary_id, reply);
        self.arrived.notify_waiters();
        answer
            .await
            .unwrap_or_else(|_| Err(RemoteError::unavailable("request abandoned")))
    }

    async fn set_completed(&self, id: RecordId, completed: bool) -> Result<(), RemoteError> {
        self.record(RemoteCall::SetCompleted(id, completed));
        Ok(())
    }

    async fn update_title(&self, id: RecordId, title: Option<String>) -> Result<(), RemoteError> {
        self.record(RemoteCall::UpdateTitle(id, title));
        Ok(())
    }

    async fn delete(&self, id: RecordId) -> Result<(), RemoteError> {
        self.record(RemoteCall::Delete(id));
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
