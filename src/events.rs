//! Domain events emitted around cell executions.
//!
//! Hosts subscribe to relay the events into their own telemetry; emission
//! never blocks and events are dropped when nobody listens.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Schema id of the cell execution events.
pub const CELL_EXECUTION_SCHEMA: &str =
    "https://events.jupyter.org/jupyter_server_nbmodel/cell_execution/v1";

/// A cell execution lifecycle event.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum CellExecutionEvent {
    /// A mirrored cell execution started.
    ExecutionStart {
        /// The executed cell.
        cell_id: String,
        /// The collaborative document containing the cell.
        document_id: String,
        /// Start time of the execution.
        timestamp: String,
    },

    /// A mirrored cell execution completed.
    ExecutionEnd {
        /// The executed cell.
        cell_id: String,
        /// The collaborative document containing the cell.
        document_id: String,
        /// End time of the execution.
        timestamp: String,
        /// Whether the kernel reported a successful execution.
        success: bool,
        /// Joined `"ename: evalue"` lines of the error outputs, empty on
        /// success.
        kernel_error: String,
    },
}

/// Fan-out of domain events to host subscribers.
#[derive(Clone, Debug)]
pub struct EventLogger {
    tx: broadcast::Sender<CellExecutionEvent>,
}

impl EventLogger {
    /// Create an event logger with a small fan-out buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CellExecutionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to every subscriber.
    pub fn emit(&self, event: CellExecutionEvent) {
        debug!(schema_id = CELL_EXECUTION_SCHEMA, event = ?event, "cell execution event");
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new()
    }
}
