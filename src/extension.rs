//! Lifecycle glue between the host server and the execution stack.
//!
//! The host builds one [`Extension`] at bring-up, mounts its router, and
//! awaits [`Extension::shutdown`] when stopping.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::collab::DocumentStore;
use crate::events::{CellExecutionEvent, EventLogger};
use crate::handlers;
use crate::kernels::KernelProvider;
use crate::stack::ExecutionStack;

/// Tunables of the extension, loadable from the host's configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bound on waiting for the execution stack to dispose at server stop,
    /// in seconds.
    pub shutdown_timeout: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shutdown_timeout: 3.0,
        }
    }
}

/// The server extension owning one execution stack.
pub struct Extension {
    stack: Arc<ExecutionStack>,
    settings: Settings,
}

impl Extension {
    /// Build the execution stack for a kernel pool and, optionally, a
    /// collaborative-document store.
    pub fn new(
        provider: Arc<dyn KernelProvider>,
        store: Option<Arc<dyn DocumentStore>>,
        settings: Settings,
    ) -> Self {
        let stack = Arc::new(ExecutionStack::new(provider, store, EventLogger::new()));
        Self { stack, settings }
    }

    /// The execution stack driven by this extension.
    pub fn stack(&self) -> &Arc<ExecutionStack> {
        &self.stack
    }

    /// Subscribe to the cell execution events emitted by the stack.
    pub fn events(&self) -> broadcast::Receiver<CellExecutionEvent> {
        self.stack.events().subscribe()
    }

    /// The API routes to mount on the host server.
    pub fn router(&self) -> Router {
        handlers::router(self.stack.clone())
    }

    /// Dispose of the execution stack, bounded by the configured timeout.
    ///
    /// Overruns are logged, not propagated: the server is shutting down
    /// anyway.
    pub async fn shutdown(&self) {
        let timeout = Duration::from_secs_f64(self.settings.shutdown_timeout);
        if tokio::time::timeout(timeout, self.stack.dispose())
            .await
            .is_err()
        {
            warn!(?timeout, "execution stack did not dispose in time");
        }
    }
}
