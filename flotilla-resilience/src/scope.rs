//! Scoped resource lifecycle
//!
//! A [`Scope`] collects exit actions while a resource is alive and runs them
//! exactly once when the resource is closed. Actions registered by separate
//! calls run last-in first-out; actions passed together to a single
//! [`Scope::on_exit_all`] call run in the order given. Every action runs even
//! when an earlier one fails, and all failures are reported together as an
//! [`AggregateError`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use flotilla_core::ClosedError;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::watch;

type ExitFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A deferred cleanup step
pub struct ExitAction(ExitFn);

impl ExitAction {
    /// Wrap an asynchronous cleanup step
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Box::new(move || action().boxed()))
    }

    /// Wrap a synchronous cleanup step
    pub fn sync<F>(action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self(Box::new(move || futures::future::ready(action()).boxed()))
    }

    async fn run(self) -> anyhow::Result<()> {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(self.0)) {
            Ok(future) => future,
            Err(panic) => return Err(panic_to_error(panic)),
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panic_to_error(panic)),
        }
    }
}

impl fmt::Debug for ExitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExitAction")
    }
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    anyhow::anyhow!("exit action panicked: {}", message)
}

/// One or more exit actions failed while a scope was closing.
#[derive(Debug)]
pub struct AggregateError {
    scope: String,
    failures: Vec<anyhow::Error>,
}

impl AggregateError {
    pub fn new(scope: impl Into<String>, failures: Vec<anyhow::Error>) -> Self {
        Self {
            scope: scope.into(),
            failures,
        }
    }

    /// Failures in the order their actions ran
    pub fn failures(&self) -> &[anyhow::Error] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<anyhow::Error> {
        self.failures
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.failures.len();
        writeln!(
            f,
            "Aggregate error closing '{}' with {} inner errors",
            self.scope, n
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            let i = i + 1;
            writeln!(f, "===Start inner error {} of {}===", i, n)?;
            writeln!(f, "{:?}", failure)?;
            writeln!(f, "===End inner error {} of {}===", i, n)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Waitable latch that is set once a scope has finished running its exit
/// actions.
#[derive(Debug, Clone)]
pub struct ClosedSignal {
    rx: watch::Receiver<bool>,
}

impl ClosedSignal {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the scope has fully unwound
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender is owned by the scope. If the scope is dropped without
        // closing, nobody can set the latch anymore.
        if rx.wait_for(|closed| *closed).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct ScopeState {
    // One group per registration call
    groups: Vec<Vec<ExitAction>>,
    closing: bool,
}

/// Ordered, failure-tolerant cleanup container
pub struct Scope {
    name: String,
    state: Mutex<ScopeState>,
    closed_tx: watch::Sender<bool>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            state: Mutex::new(ScopeState {
                groups: Vec::new(),
                closing: false,
            }),
            closed_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an asynchronous exit action
    pub fn on_exit<F, Fut>(&self, action: F) -> Result<(), ClosedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_exit_all(vec![ExitAction::new(action)])
    }

    /// Register a synchronous exit action
    pub fn on_exit_sync<F>(&self, action: F) -> Result<(), ClosedError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.on_exit_all(vec![ExitAction::sync(action)])
    }

    /// Register several actions that run in the given order relative to
    /// each other.
    pub fn on_exit_all(&self, actions: Vec<ExitAction>) -> Result<(), ClosedError> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(ClosedError::new("scope"));
        }
        state.groups.push(actions);
        Ok(())
    }

    /// Whether close has started
    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal {
            rx: self.closed_tx.subscribe(),
        }
    }

    /// Run every exit action once. Later calls return immediately.
    pub async fn close(&self) -> Result<(), AggregateError> {
        let groups = {
            let mut state = self.state.lock();
            if state.closing {
                return Ok(());
            }
            state.closing = true;
            std::mem::take(&mut state.groups)
        };

        debug!("Closing scope '{}' ({} exit groups)", self.name, groups.len());

        let mut failures = Vec::new();
        for group in groups.into_iter().rev() {
            for action in group {
                if let Err(e) = action.run().await {
                    warn!("Exit action failed in scope '{}': {:#}", self.name, e);
                    failures.push(e);
                }
            }
        }

        self.closed_tx.send_replace(true);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(self.name.clone(), failures))
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.closing && !state.groups.is_empty() {
            warn!(
                "Scope '{}' dropped without being closed; {} exit groups never ran",
                self.name,
                state.groups.len()
            );
        }
    }
}

/// A resource whose lifetime is governed by a [`Scope`]
#[async_trait::async_trait]
pub trait Scoped: Send + Sync {
    fn scope(&self) -> &Scope;

    async fn close(&self) -> Result<(), AggregateError> {
        self.scope().close().await
    }

    fn closed(&self) -> ClosedSignal {
        self.scope().closed_signal()
    }
}

/// Run `body` with a fresh scope and close the scope afterwards, whatever
/// the body returned. A body error is returned with any close failures
/// attached as context; its root cause stays the body error.
pub async fn scoped<F, Fut, T>(name: &str, body: F) -> anyhow::Result<T>
where
    F: FnOnce(Arc<Scope>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let scope = Arc::new(Scope::new(name));
    let result = body(scope.clone()).await;
    let closed = scope.close().await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(aggregate)) => Err(aggregate.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(aggregate)) => Err(e.context(aggregate)),
    }
}
