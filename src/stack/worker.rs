//! The per-kernel worker task driving one execution at a time.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::collab::{CellMirror, DocumentStore};
use crate::events::{CellExecutionEvent, EventLogger};
use crate::kernels::{ExecuteEvent, KernelClient};
use crate::models::{
    ExecutionOutcome, ExecutionRequest, InputDescription, InputRequest, PendingInput,
};
use crate::outputs::{self, Output};
use crate::wire_protocol::{KernelMessage, KernelMessageType, ReplyStatus};
use crate::Error;

use super::ResultSlot;

/// Everything a worker needs to process one kernel's requests.
pub(crate) struct WorkerContext {
    pub(crate) kernel_id: String,
    pub(crate) client: Arc<dyn KernelClient>,
    pub(crate) store: Option<Arc<dyn DocumentStore>>,
    pub(crate) events: EventLogger,
    pub(crate) queue: async_channel::Receiver<ExecutionRequest>,
    pub(crate) results: Arc<DashMap<String, ResultSlot>>,
    pub(crate) pending_input: Arc<Mutex<PendingInput>>,
    pub(crate) token: CancellationToken,
}

/// Process execution requests in order for a kernel.
///
/// At most one execution is in flight at a time. A failure while processing
/// one request does not stop the worker for the kernel; only cancellation
/// does.
pub(crate) async fn kernel_worker(ctx: WorkerContext) {
    debug!(kernel_id = %ctx.kernel_id, "starting worker to process execution requests");
    loop {
        let request = tokio::select! {
            _ = ctx.token.cancelled() => break,
            request = ctx.queue.recv() => match request {
                Ok(request) => request,
                Err(_) => break,
            },
        };
        let request_id = request.request_id.clone();
        debug!(kernel_id = %ctx.kernel_id, %request_id, "processing execution request");

        let result = tokio::select! {
            _ = ctx.token.cancelled() => {
                // Record a best-effort error for the in-flight request and
                // drain the rest of the queue without executing it.
                ctx.results.insert(
                    request_id,
                    ResultSlot::Failed { error: "execution was cancelled".into() },
                );
                while ctx.queue.try_recv().is_ok() {}
                break;
            }
            result = execute_snippet(&ctx, &request) => result,
        };
        match result {
            Ok(outcome) => {
                ctx.results
                    .insert(request_id.clone(), ResultSlot::Done(outcome));
                debug!(kernel_id = %ctx.kernel_id, %request_id, "execution request processed");
            }
            Err(err @ Error::NotCodeCell { .. }) => {
                // A user error: reject this request, keep serving the rest.
                ctx.results.insert(
                    request_id,
                    ResultSlot::Failed {
                        error: err.to_string(),
                    },
                );
            }
            Err(err) => {
                error!(
                    kernel_id = %ctx.kernel_id, %request_id, error = %err,
                    "failed to process execution request"
                );
            }
        }
    }
    debug!(kernel_id = %ctx.kernel_id, "execution request worker stopped");
}

/// Run one snippet to completion, mirroring outputs as they arrive.
async fn execute_snippet(
    ctx: &WorkerContext,
    request: &ExecutionRequest,
) -> Result<ExecutionOutcome, Error> {
    let mut mirror = CellMirror::resolve(ctx.store.as_ref(), &request.metadata).await?;
    if let Some(mirror) = &mut mirror {
        let started = mirror.begin();
        ctx.events.emit(CellExecutionEvent::ExecutionStart {
            cell_id: mirror.cell_id().to_string(),
            document_id: mirror.document_id().to_string(),
            timestamp: started,
        });
    }

    // Gateway clients attach their channels on first use.
    ctx.client.start_channels().await?;
    let events = ctx
        .client
        .execute(&request.snippet, &request.request_id)
        .await?;

    let mut result_outputs: Vec<Output> = Vec::new();
    let reply = loop {
        match events.recv().await {
            Ok(ExecuteEvent::Iopub(msg)) => {
                handle_iopub(&mut result_outputs, mirror.as_ref(), &msg)?;
            }
            Ok(ExecuteEvent::InputRequest(msg)) => {
                if ctx.client.allow_stdin() {
                    register_pending_input(ctx, &request.request_id, &msg)?;
                }
            }
            Ok(ExecuteEvent::Reply(reply)) => break reply,
            Err(_) => return Err(Error::KernelDisconnect),
        }
    };

    if let Some(mirror) = &mut mirror {
        let ended = mirror.finish(reply.status, reply.execution_count);
        ctx.events.emit(CellExecutionEvent::ExecutionEnd {
            cell_id: mirror.cell_id().to_string(),
            document_id: mirror.document_id().to_string(),
            timestamp: ended,
            success: reply.status == ReplyStatus::Ok,
            kernel_error: outputs::error_summary(&result_outputs),
        });
    }

    Ok(ExecutionOutcome {
        status: reply.status,
        execution_count: reply.execution_count,
        outputs: serde_json::to_string(&result_outputs).expect("outputs JSON serialization"),
    })
}

/// Apply one iopub message to the result outputs and the mirrored cell.
fn handle_iopub(
    result_outputs: &mut Vec<Output>,
    mirror: Option<&CellMirror>,
    msg: &KernelMessage,
) -> Result<(), Error> {
    match msg.header.msg_type {
        KernelMessageType::Stream
        | KernelMessageType::DisplayData
        | KernelMessageType::ExecuteResult
        | KernelMessageType::Error => {
            let Some(output) = outputs::output_from_msg(msg)? else {
                return Ok(());
            };
            result_outputs.push(output.clone());
            if let Some(mirror) = mirror {
                match output {
                    Output::Stream(stream) => mirror.append_stream(stream),
                    other => mirror.append_output(other),
                }
            }
        }
        KernelMessageType::ClearOutput => {
            // The `wait` flag is not honored.
            result_outputs.clear();
            if let Some(mirror) = mirror {
                mirror.clear_outputs();
            }
        }
        KernelMessageType::UpdateDisplayData => {}
        _ => {}
    }
    Ok(())
}

/// Record a stdin prompt as the temporary answer to the execution request.
fn register_pending_input(
    ctx: &WorkerContext,
    request_id: &str,
    msg: &KernelMessage,
) -> Result<(), Error> {
    debug!(kernel_id = %ctx.kernel_id, %request_id, "execution request received an input request");
    let content: InputRequest = serde_json::from_value(msg.content.clone())
        .map_err(|err| Error::DeserializeMessage(err.to_string()))?;
    let mut pending = ctx.pending_input.lock().expect("pending input lock");
    if pending.is_pending() {
        error!(
            kernel_id = %ctx.kernel_id,
            "received an input request while already waiting for an input"
        );
    }
    pending.set(
        request_id,
        InputDescription {
            parent_header: msg.header.clone(),
            input_request: content,
        },
    );
    Ok(())
}
