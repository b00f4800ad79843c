pub mod bus;
pub mod context;
pub mod diff;
pub mod error;
pub mod reconciler;
pub mod remote;
pub mod store;

pub use bus::{ActionBus, BusHandle, Round, Token};
pub use context::AppContext;
pub use diff::{diff, EditScript, Keyed};
pub use error::{BusError, CoreError, StoreError};
pub use reconciler::{ProjectedRow, ProjectionUpdate, Reconciler, SharedProjection, UpdateStream};
pub use remote::{ManualRemote, OfflineRemote, RemoteCall, RemoteService, SimulatedRemote};
pub use store::{
    ChangeStream, DeleteMode, StoreNotice, StoreOptions, StoreSnapshot, TransactionalStore,
};
