//! Action dispatcher with dependency-ordered fan-out.
//!
//! Every dispatch round runs on one dedicated worker thread, so rounds never
//! overlap. Listeners run synchronously, in token order, and may force other
//! listeners to run first with [`Round::wait_for`].

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Listener<A> = dyn Fn(&A, &Round<'_, A>) -> Result<(), BusError> + Send + Sync;

struct Registry<A> {
    last_token: u64,
    listeners: BTreeMap<Token, Arc<Listener<A>>>,
}

enum Command<A> {
    Dispatch(A),
    DispatchReported(A, oneshot::Sender<Result<(), BusError>>),
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable access to a running bus: registration and enqueueing only.
pub struct BusHandle<A> {
    registry: Arc<Mutex<Registry<A>>>,
    commands: Sender<Command<A>>,
    // Dispatches issued by listeners; only the worker thread touches it.
    deferred: Arc<Mutex<VecDeque<A>>>,
    worker: ThreadId,
}

impl<A> Clone for BusHandle<A> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            commands: self.commands.clone(),
            deferred: Arc::clone(&self.deferred),
            worker: self.worker,
        }
    }
}

/// Owns the dispatch thread. Dropping it drains queued dispatches and joins.
pub struct ActionBus<A: fmt::Debug + Send + 'static> {
    handle: BusHandle<A>,
    worker: Option<JoinHandle<()>>,
}

impl<A: fmt::Debug + Send + 'static> ActionBus<A> {
    /// Starts the dispatch thread.
    pub fn new() -> std::io::Result<Self> {
        let registry = Arc::new(Mutex::new(Registry {
            last_token: 0,
            listeners: BTreeMap::new(),
        }));
        let deferred = Arc::new(Mutex::new(VecDeque::new()));
        let (commands, inbox) = unbounded();
        let worker_registry = Arc::clone(&registry);
        let worker_deferred = Arc::clone(&deferred);
        let worker = thread::Builder::new()
            .name("action-bus".into())
            .spawn(move || run_worker(worker_registry, worker_deferred, inbox))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            handle: BusHandle {
                registry,
                commands,
                deferred,
                worker: worker_id,
            },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> BusHandle<A> {
        self.handle.clone()
    }

    pub fn register<F>(&self, listener: F) -> Token
    where
        F: Fn(&A, &Round<'_, A>) -> Result<(), BusError> + Send + Sync + 'static,
    {
        self.handle.register(listener)
    }

    pub fn unregister(&self, token: Token) -> Result<(), BusError> {
        self.handle.unregister(token)
    }

    pub fn dispatch(&self, action: A) -> Result<(), BusError> {
        self.handle.dispatch(action)
    }

    pub fn dispatch_and_wait(&self, action: A) -> Result<(), BusError> {
        self.handle.dispatch_and_wait(action)
    }

    pub async fn flush(&self) -> Result<(), BusError> {
        self.handle.flush().await
    }

    pub fn flush_blocking(&self) -> Result<(), BusError> {
        self.handle.flush_blocking()
    }

    /// Finishes every queued dispatch, then stops the worker thread.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if thread::current().id() == worker.thread().id() {
            warn!("action bus shutdown requested from its own thread; detaching");
            return;
        }
        let _ = self.handle.commands.send(Command::Shutdown);
        if worker.join().is_err() {
            error!("action bus thread terminated by panic");
        }
    }
}

impl<A: fmt::Debug + Send + 'static> Drop for ActionBus<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<A: fmt::Debug + Send + 'static> BusHandle<A> {
    /// Adds a listener for every later dispatch round and returns its token.
    /// Tokens increase monotonically and are never reused.
    pub fn register<F>(&self, listener: F) -> Token
    where
        F: Fn(&A, &Round<'_, A>) -> Result<(), BusError> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.last_token += 1;
        let token = Token(registry.last_token);
        registry.listeners.insert(token, Arc::new(listener));
        debug!(%token, "registered listener");
        token
    }

    /// Removes a listener. A round already in progress still sees it.
    pub fn unregister(&self, token: Token) -> Result<(), BusError> {
        if self.registry.lock().listeners.remove(&token).is_none() {
            error!(%token, "unregister called with a token that maps to no listener");
            return Err(BusError::UnknownToken(token));
        }
        debug!(%token, "unregistered listener");
        Ok(())
    }

    /// Queues `action` for its own dispatch round. Called from inside a
    /// listener, the round runs right after the current one finishes, ahead
    /// of anything queued from outside.
    pub fn dispatch(&self, action: A) -> Result<(), BusError> {
        if self.on_worker_thread() {
            debug!(?action, "deferring dispatch issued during a round");
            self.deferred.lock().push_back(action);
            return Ok(());
        }
        self.commands
            .send(Command::Dispatch(action))
            .map_err(|_| BusError::Closed)
    }

    /// Dispatches and blocks until the round has finished, returning its outcome.
    pub fn dispatch_and_wait(&self, action: A) -> Result<(), BusError> {
        if self.on_worker_thread() {
            return Err(BusError::Reentrant);
        }
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::DispatchReported(action, reply))
            .map_err(|_| BusError::Closed)?;
        outcome.blocking_recv().map_err(|_| BusError::Closed)?
    }

    /// Resolves once every dispatch queued before this call has completed,
    /// including the rounds those dispatches deferred.
    pub async fn flush(&self) -> Result<(), BusError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Barrier(reply))
            .map_err(|_| BusError::Closed)?;
        done.await.map_err(|_| BusError::Closed)
    }

    pub fn flush_blocking(&self) -> Result<(), BusError> {
        if self.on_worker_thread() {
            return Err(BusError::Reentrant);
        }
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Barrier(reply))
            .map_err(|_| BusError::Closed)?;
        done.blocking_recv().map_err(|_| BusError::Closed)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.worker
    }
}

fn run_worker<A: fmt::Debug>(
    registry: Arc<Mutex<Registry<A>>>,
    deferred: Arc<Mutex<VecDeque<A>>>,
    inbox: Receiver<Command<A>>,
) {
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Dispatch(action) => {
                let _ = dispatch_round(&registry, &action);
            }
            Command::DispatchReported(action, reply) => {
                let outcome = dispatch_round(&registry, &action);
                let _ = reply.send(outcome);
            }
            Command::Barrier(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown => break,
        }
        while let Some(action) = next_deferred(&deferred) {
            let _ = dispatch_round(&registry, &action);
        }
    }
    debug!("action bus worker stopped");
}

fn next_deferred<A>(deferred: &Mutex<VecDeque<A>>) -> Option<A> {
    deferred.lock().pop_front()
}

fn dispatch_round<A: fmt::Debug>(
    registry: &Mutex<Registry<A>>,
    action: &A,
) -> Result<(), BusError> {
    let listeners = registry.lock().listeners.clone();
    let round = Round::new(action, &listeners);
    let outcome = round.run();
    if let Err(err) = &outcome {
        error!(?action, error = %err, "dispatch round aborted");
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Pending,
    Handled,
}

/// Bookkeeping for a single dispatch round, handed to each listener.
pub struct Round<'a, A> {
    action: &'a A,
    listeners: &'a BTreeMap<Token, Arc<Listener<A>>>,
    status: RefCell<BTreeMap<Token, Status>>,
    failure: RefCell<Option<BusError>>,
}

impl<'a, A> Round<'a, A> {
    fn new(action: &'a A, listeners: &'a BTreeMap<Token, Arc<Listener<A>>>) -> Self {
        Self {
            action,
            listeners,
            status: RefCell::new(listeners.keys().map(|&t| (t, Status::Idle)).collect()),
            failure: RefCell::new(None),
        }
    }

    pub fn action(&self) -> &A {
        self.action
    }

    /// Runs the listeners behind `tokens` now, before the caller continues.
    /// Already finished listeners are skipped. Waiting on a listener that is
    /// still running is a cycle and aborts the whole round.
    pub fn wait_for(&self, tokens: &[Token]) -> Result<(), BusError> {
        for &token in tokens {
            if let Some(err) = self.failure.borrow().clone() {
                return Err(err);
            }
            let Some(listener) = self.listeners.get(&token) else {
                return Err(self.fail(BusError::UnknownToken(token)));
            };
            match self.status_of(token) {
                Status::Handled => continue,
                Status::Pending => return Err(self.fail(BusError::CircularDependency(token))),
                Status::Idle => self.invoke(token, listener)?,
            }
        }
        Ok(())
    }

    fn run(&self) -> Result<(), BusError> {
        for (&token, listener) in self.listeners {
            if self.status_of(token) == Status::Idle {
                let _ = self.invoke(token, listener);
            }
            if let Some(err) = self.failure.borrow().clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn invoke(&self, token: Token, listener: &Arc<Listener<A>>) -> Result<(), BusError> {
        self.status.borrow_mut().insert(token, Status::Pending);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(self.action, self)))
            .unwrap_or(Err(BusError::ListenerPanicked(token)));
        self.status.borrow_mut().insert(token, Status::Handled);
        outcome.map_err(|err| self.fail(err))
    }

    fn status_of(&self, token: Token) -> Status {
        self.status
            .borrow()
            .get(&token)
            .copied()
            .unwrap_or(Status::Idle)
    }

    // The first failure wins; it aborts the round even if a listener drops it.
    fn fail(&self, err: BusError) -> BusError {
        self.failure.borrow_mut().get_or_insert(err).clone()
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
