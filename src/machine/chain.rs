//! Named, ordered lifecycle step chains.
//!
//! A machine start sequence is composed of named asynchronous steps sharing
//! the machine record as argument. Steps run in order and the first failure
//! aborts the chain. Named insertion lets a driver (or a test) splice steps
//! in without rewriting the sequence.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::{debug, error};

use crate::error::DaemonError;
use crate::machine::Machine;

pub type HandlerFuture = BoxFuture<'static, Result<(), DaemonError>>;
pub type HandlerFn = Arc<dyn Fn(Arc<Machine>) -> HandlerFuture + Send + Sync>;

/// One named step.
#[derive(Clone)]
pub struct Handler {
    pub name: String,
    func: HandlerFn,
}

impl Handler {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Arc<Machine>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DaemonError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |machine| Box::pin(func(machine))),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}

/// Ordered chain of handlers.
#[derive(Debug, Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Handler>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn append<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Arc<Machine>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DaemonError>> + Send + 'static,
    {
        self.handlers.push(Handler::new(name, func));
        self
    }

    pub fn prepend<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Arc<Machine>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DaemonError>> + Send + 'static,
    {
        self.handlers.insert(0, Handler::new(name, func));
        self
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    /// Insert before the named step; fails if the target is absent.
    pub fn insert_before(
        &mut self,
        target: &str,
        handler: Handler,
    ) -> Result<(), DaemonError> {
        let index = self.position(target).ok_or_else(|| {
            DaemonError::Internal(format!("no handler named {} in chain", target))
        })?;
        self.handlers.insert(index, handler);
        Ok(())
    }

    /// Insert after the named step; fails if the target is absent.
    pub fn insert_after(&mut self, target: &str, handler: Handler) -> Result<(), DaemonError> {
        let index = self.position(target).ok_or_else(|| {
            DaemonError::Internal(format!("no handler named {} in chain", target))
        })?;
        self.handlers.insert(index + 1, handler);
        Ok(())
    }

    /// Remove the named step. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.handlers.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every step in order; the first failure aborts the chain and the
    /// error message names the failing step.
    pub async fn run(&self, machine: Arc<Machine>) -> Result<(), DaemonError> {
        for handler in &self.handlers {
            debug!(machine = %machine.id, step = %handler.name, "Running lifecycle step");
            if let Err(e) = (handler.func)(Arc::clone(&machine)).await {
                error!(machine = %machine.id, step = %handler.name, error = %e, "Lifecycle step failed");
                return Err(tag_step(handler.name.as_str(), e));
            }
        }
        Ok(())
    }
}

/// Prefix the failing step's name onto the error message, keeping the tag.
fn tag_step(step: &str, error: DaemonError) -> DaemonError {
    use DaemonError::*;

    let prefix = |m: String| format!("{}: {}", step, m);
    match error {
        Validation(m) => Validation(prefix(m)),
        BadRequest(m) => BadRequest(prefix(m)),
        PathTraversal(m) => PathTraversal(prefix(m)),
        Unauthorized(m) => Unauthorized(prefix(m)),
        Forbidden(m) => Forbidden(prefix(m)),
        NotFound(m) => NotFound(prefix(m)),
        Vsock(m) => Vsock(prefix(m)),
        FirecrackerApi { status, message } => FirecrackerApi {
            status,
            message: prefix(message),
        },
        CloudHypervisorApi { status, message } => CloudHypervisorApi {
            status,
            message: prefix(message),
        },
        DockerCli(m) => DockerCli(prefix(m)),
        Timeout(m) => Timeout(prefix(m)),
        CircuitOpen(m) => CircuitOpen(prefix(m)),
        Runtime(m) => Runtime(prefix(m)),
        Internal(m) => Internal(prefix(m)),
    }
}
