use std::sync::Arc;

use shared::{action::Action, domain::Record};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    bus::{ActionBus, BusHandle, Token},
    error::CoreError,
    reconciler::{ProjectedRow, Reconciler, UpdateStream},
    remote::RemoteService,
    store::{StoreNotice, StoreOptions, StoreSnapshot, TransactionalStore},
};

/// Everything one running list needs, built once and passed around
/// explicitly. One instance per process run, or per test.
pub struct AppContext {
    bus: ActionBus<Action>,
    store: TransactionalStore,
    store_token: Token,
    reconciler: Reconciler,
}

impl AppContext {
    /// Starts the bus, the store and the reconciler, and wires the store to
    /// the bus. Must be called inside a tokio runtime.
    pub async fn start(
        storage: Storage,
        remote: Arc<dyn RemoteService>,
        options: StoreOptions,
    ) -> Result<(Self, UpdateStream), CoreError> {
        let bus = ActionBus::new()?;
        let delete_mode = options.delete_mode;
        let (store, changes) = TransactionalStore::spawn(storage, remote, bus.handle(), options);
        let store_token = store.register(&bus.handle());
        let (reconciler, updates) = Reconciler::spawn(store.clone(), changes).await?;
        info!(
            ?delete_mode,
            rows = reconciler.projection().len(),
            "context started"
        );

        Ok((
            Self {
                bus,
                store,
                store_token,
                reconciler,
            },
            updates,
        ))
    }

    pub fn dispatch(&self, action: Action) -> Result<(), CoreError> {
        self.bus.dispatch(action)?;
        Ok(())
    }

    pub fn bus(&self) -> BusHandle<Action> {
        self.bus.handle()
    }

    /// Waits until everything dispatched so far has been handled by the
    /// store and reflected in the projection. Remote confirmations still in
    /// flight are not waited for.
    pub async fn settle(&self) -> Result<(), CoreError> {
        self.bus.flush().await?;
        self.store.sync().await?;
        self.reconciler.sync().await
    }

    pub async fn records(&self) -> Result<Vec<Record>, CoreError> {
        Ok(self.store.get_all().await?)
    }

    pub async fn snapshot(&self) -> Result<StoreSnapshot, CoreError> {
        Ok(self.store.snapshot().await?)
    }

    pub fn projection(&self) -> Arc<Vec<ProjectedRow>> {
        self.reconciler.projection()
    }

    pub fn notices(&self) -> broadcast::Receiver<StoreNotice> {
        self.store.subscribe_notices()
    }

    /// Detaches the store, drains every queue, and stops all three contexts.
    pub async fn shutdown(self) -> Result<(), CoreError> {
        let Self {
            mut bus,
            store,
            store_token,
            reconciler,
        } = self;

        bus.unregister(store_token)?;
        bus.flush().await?;
        store.shutdown().await?;
        if let Err(err) = reconciler.shutdown().await {
            warn!(error = %err, "reconciler already stopped");
        }
        if let Err(err) = tokio::task::spawn_blocking(move || bus.shutdown()).await {
            warn!(error = %err, "action bus did not stop cleanly");
        }
        info!("context stopped");
        Ok(())
    }
}
