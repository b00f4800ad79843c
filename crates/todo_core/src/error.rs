use thiserror::Error;

use crate::bus::Token;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("token {0} does not map to a registered listener")]
    UnknownToken(Token),
    #[error("circular dependency detected while waiting for listener {0}")]
    CircularDependency(Token),
    #[error("listener {0} panicked during dispatch")]
    ListenerPanicked(Token),
    #[error("cannot wait on a dispatch from inside a dispatch round")]
    Reentrant,
    #[error("action bus is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store actor is no longer running")]
    Closed,
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to start action bus: {0}")]
    Startup(#[from] std::io::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reconciler is no longer running")]
    ReconcilerClosed,
}
