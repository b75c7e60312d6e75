//! Mirroring execution state into live collaborative documents.
//!
//! The collaborative-document server is an external collaborator: this
//! module fixes the lookup and transaction contracts it must provide, and
//! implements the cell mirror that writes outputs, execution counts,
//! execution state, and timing metadata into the executed cell. Every
//! multi-step mutation goes through one document transaction so that
//! collaborators observe atomic updates.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::models::RequestMetadata;
use crate::outputs::{self, Output, Stream};
use crate::wire_protocol::ReplyStatus;
use crate::Error;

/// State of one shared notebook cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellState {
    /// Identifier of the cell.
    pub id: String,

    /// Cell type: `code`, `markdown`, or `raw`.
    pub cell_type: String,

    /// Source text of the cell.
    pub source: String,

    /// Outputs from executing the cell.
    #[serde(default)]
    pub outputs: Vec<Output>,

    /// Execution count of the cell (null if not executed).
    pub execution_count: Option<i32>,

    /// Execution state of the cell: `running` or `idle`.
    #[serde(default)]
    pub execution_state: String,

    /// Metadata for the cell.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A live collaborative document holding notebook cells.
pub trait CollabDocument: Send + Sync {
    /// Run `f` over the document's cell list as one atomic transaction.
    fn transact(&self, f: &mut dyn FnMut(&mut Vec<CellState>));
}

/// Lookup of live collaborative documents by room id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Resolve the live document for `room_id`, if one is open.
    async fn get_document(&self, room_id: &str) -> Option<Arc<dyn CollabDocument>>;
}

/// Writes execution state and outputs of one request into its shared cell.
pub struct CellMirror {
    doc: Arc<dyn CollabDocument>,
    document_id: String,
    cell_id: String,
    record_timing: bool,
    time_info: Map<String, Value>,
}

impl std::fmt::Debug for CellMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellMirror")
            .field("document_id", &self.document_id)
            .field("cell_id", &self.cell_id)
            .field("record_timing", &self.record_timing)
            .field("time_info", &self.time_info)
            .finish()
    }
}

impl CellMirror {
    /// Resolve the mirror target of a request from its metadata.
    ///
    /// Returns `Ok(None)` when mirroring should be skipped (no
    /// collaboration service, no cell reference, document or cell not
    /// found), logging the reason. Referencing a cell that is not a code
    /// cell is a user error and fails the request.
    pub async fn resolve(
        store: Option<&Arc<dyn DocumentStore>>,
        metadata: &RequestMetadata,
    ) -> Result<Option<Self>, Error> {
        let Some(store) = store else {
            warn!(
                "collaboration service is not available on the server; \
                 outputs won't be written within the document"
            );
            return Ok(None);
        };
        let (Some(document_id), Some(cell_id)) = (&metadata.document_id, &metadata.cell_id) else {
            debug!(
                "document_id and cell_id not defined; \
                 the outputs won't be written within the document"
            );
            return Ok(None);
        };
        let Some(doc) = store.get_document(document_id).await else {
            warn!(document_id, "document not found");
            return Ok(None);
        };

        let mut matches = 0usize;
        let mut cell_type = None;
        doc.transact(&mut |cells| {
            matches = cells.iter().filter(|c| &c.id == cell_id).count();
            cell_type = cells
                .iter()
                .find(|c| &c.id == cell_id)
                .map(|c| c.cell_type.clone());
        });
        let Some(cell_type) = cell_type else {
            warn!(cell_id, document_id, "cell not found in document");
            return Ok(None);
        };
        if matches > 1 {
            warn!(cell_id, "multiple cells have the same id");
        }
        if cell_type != "code" {
            error!(cell_id, document_id, "cell is not of type code");
            return Err(Error::NotCodeCell {
                document_id: document_id.clone(),
                cell_id: cell_id.clone(),
            });
        }

        Ok(Some(Self {
            doc,
            document_id: document_id.clone(),
            cell_id: cell_id.clone(),
            record_timing: metadata.record_timing,
            time_info: Map::new(),
        }))
    }

    /// The collaborative document containing the mirrored cell.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// The mirrored cell.
    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    fn with_cell(&self, f: &mut dyn FnMut(&mut CellState)) {
        let cell_id = self.cell_id.clone();
        self.doc.transact(&mut |cells| {
            if let Some(cell) = cells.iter_mut().find(|c| c.id == cell_id) {
                f(cell);
            }
        });
    }

    /// Reset the cell for a fresh run and stamp the execution start.
    ///
    /// Returns the start timestamp, also used for the `execution_start`
    /// event.
    pub fn begin(&mut self) -> String {
        let started = execution_timestamp();
        if self.record_timing {
            self.time_info
                .insert("shell.execute_reply.started".into(), started.clone().into());
            // jupyterlab-execute-time reads this key as well.
            self.time_info
                .insert("iopub.execute_input".into(), started.clone().into());
        }
        let record_timing = self.record_timing;
        let time_info = self.time_info.clone();
        self.with_cell(&mut |cell| {
            cell.outputs.clear();
            cell.execution_count = None;
            cell.execution_state = "running".into();
            cell.metadata.remove("execution");
            if record_timing {
                cell.metadata
                    .insert("execution".into(), Value::Object(time_info.clone()));
            }
        });
        started
    }

    /// Append a non-stream output to the cell.
    pub fn append_output(&self, output: Output) {
        self.with_cell(&mut |cell| cell.outputs.push(output.clone()));
    }

    /// Append a stream output to the cell, coalescing it with the previous
    /// record when possible.
    pub fn append_stream(&self, stream: Stream) {
        self.with_cell(&mut |cell| outputs::append_stream(&mut cell.outputs, stream.clone()));
    }

    /// Truncate the cell outputs.
    pub fn clear_outputs(&self) {
        self.with_cell(&mut |cell| cell.outputs.clear());
    }

    /// Record the end of the execution.
    ///
    /// Returns the end timestamp, also used for the `execution_end` event.
    pub fn finish(&mut self, status: ReplyStatus, execution_count: Option<i32>) -> String {
        let ended = execution_timestamp();
        if self.record_timing {
            let key = if status == ReplyStatus::Ok {
                "shell.execute_reply"
            } else {
                "execution_failed"
            };
            self.time_info.insert(key.into(), ended.clone().into());
        }
        let record_timing = self.record_timing;
        let time_info = self.time_info.clone();
        self.with_cell(&mut |cell| {
            cell.execution_count = execution_count;
            cell.execution_state = "idle".into();
            if record_timing {
                cell.metadata
                    .insert("execution".into(), Value::Object(time_info.clone()));
            }
        });
        ended
    }
}

/// UTC timestamp without offset, microsecond precision.
///
/// Sub-second precision keeps `shell.execute_reply` strictly greater than
/// `shell.execute_reply.started` even for executions that finish within a
/// second.
fn execution_timestamp() -> String {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"
    );
    OffsetDateTime::now_utc()
        .format(&format)
        .expect("execution timestamp format")
}
