//! Data model of execution requests and their polled results.

use serde::{Deserialize, Serialize};

use crate::wire_protocol::{KernelHeader, ReplyStatus};

/// Recognized metadata keys of an execution request. Unknown keys are
/// ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Realtime-collaboration document the executed cell belongs to.
    pub document_id: Option<String>,

    /// The executed cell inside that document.
    pub cell_id: Option<String>,

    /// Whether to record execution timing in the cell metadata.
    #[serde(default)]
    pub record_timing: bool,
}

/// One queued execution request, immutable once enqueued.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Opaque unique handle returned to the submitter.
    pub request_id: String,

    /// The source text to execute.
    pub snippet: String,

    /// Execution context for the request.
    pub metadata: RequestMetadata,
}

/// `input_request` content relayed to the poller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRequest {
    /// The prompt to display to the user.
    pub prompt: String,

    /// Whether the input is a password and should be hidden.
    pub password: bool,
}

/// A pending input prompt, tagged with the header of the stdin message that
/// raised it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct InputDescription {
    /// Header of the `input_request` message.
    pub parent_header: KernelHeader,

    /// The prompt itself.
    pub input_request: InputRequest,
}

/// The single pending-input slot of a kernel.
///
/// When `content` is set, `request_id` is the currently executing request;
/// both fields are cleared atomically once the stdin reply is sent.
#[derive(Debug, Default)]
pub struct PendingInput {
    request_id: Option<String>,
    content: Option<InputDescription>,
}

impl PendingInput {
    /// Record a stdin prompt on behalf of `request_id`.
    pub fn set(&mut self, request_id: &str, content: InputDescription) {
        self.request_id = Some(request_id.to_string());
        self.content = Some(content);
    }

    /// Clear the pending input.
    pub fn clear(&mut self) {
        self.request_id = None;
        self.content = None;
    }

    /// Whether a pending input is ongoing or not.
    pub fn is_pending(&self) -> bool {
        self.request_id.is_some()
    }

    /// The prompt, only if it belongs to `request_id`.
    ///
    /// A poll for a later request must never capture an earlier request's
    /// input prompt.
    pub fn for_request(&self, request_id: &str) -> Option<InputDescription> {
        if self.request_id.as_deref() == Some(request_id) {
            self.content.clone()
        } else {
            None
        }
    }
}

/// Terminal record of one executed request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Completion status reported by the kernel.
    pub status: ReplyStatus,

    /// The execution count from the reply, if any.
    pub execution_count: Option<i32>,

    /// JSON-encoded array of the outputs emitted by the execution.
    pub outputs: String,
}

/// The state of a request slot as observed by one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionPoll {
    /// The request is queued or running; poll again later.
    Pending,

    /// The request is waiting for the caller to provide standard input.
    InputRequired(InputDescription),

    /// The request completed; this value is returned exactly once.
    Done(ExecutionOutcome),

    /// The worker failed while processing the request; returned exactly
    /// once.
    Failed {
        /// Human-readable failure message.
        error: String,
    },
}
