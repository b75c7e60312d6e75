//! The subset of the Jupyter kernel wire protocol this server consumes.
//!
//! See the [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! page for documentation about how this works. The transport itself lives
//! with the host server's kernel clients; the execution stack only inspects
//! message headers, iopub payloads, stdin prompts, and execute replies.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::Error;

/// Type of a kernel wire protocol message, either request or reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum KernelMessageType {
    /// Execute a block of code.
    ExecuteRequest,

    /// Return execution results.
    ExecuteReply,

    /// Request from the kernel for standard input.
    InputRequest,

    /// Reply to the kernel with standard input.
    InputReply,

    /// Streams of output (stdout, stderr) from the kernel.
    Stream,

    /// Bring back data to be displayed in frontends.
    DisplayData,

    /// Update display data with new information.
    UpdateDisplayData,

    /// Re-broadcast of code in ExecuteRequest.
    ExecuteInput,

    /// Results of a code execution.
    ExecuteResult,

    /// When an error occurs during code execution.
    Error,

    /// Updates about kernel status.
    Status,

    /// Clear output visible on the frontend.
    ClearOutput,

    /// Another kernel message type that is unrecognized.
    #[serde(untagged)]
    Other(String),
}

/// Header of a message, generally part of the {header, parent_header,
/// metadata, content, buffers} 5-tuple.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelHeader {
    /// Typically UUID, must be unique per message.
    pub msg_id: String,

    /// Typically UUID, should be unique per session.
    pub session: String,

    /// The username of the user sending the message.
    pub username: String,

    /// ISO 8601 timestamp for when the message is created.
    #[serde(with = "time::serde::iso8601")]
    pub date: OffsetDateTime,

    /// The message type.
    pub msg_type: KernelMessageType,

    /// Message protocol version.
    pub version: String,
}

/// A message received from a Jupyter kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelMessage<T = serde_json::Value> {
    /// The message header.
    pub header: KernelHeader,

    /// The parent message header, if any.
    pub parent_header: Option<KernelHeader>,

    /// The content of the message.
    pub content: T,

    /// Buffers for large data, if any (used by extensions).
    pub buffers: Vec<Bytes>,
}

impl<T> KernelMessage<T> {
    /// Create a basic kernel message with the given header and content.
    pub fn new(msg_type: KernelMessageType, content: T) -> Self {
        Self {
            header: KernelHeader {
                msg_id: Uuid::new_v4().to_string(),
                session: "nbexec-session".to_string(),
                username: "nbexec-user".to_string(),
                date: OffsetDateTime::now_utc(),
                msg_type,
                version: "5.4".into(),
            },
            parent_header: None,
            content,
            buffers: Vec::new(),
        }
    }
}

impl<T: Serialize> KernelMessage<T> {
    /// Produce a variant of the message as a serialized JSON type.
    pub fn into_json(self) -> KernelMessage {
        KernelMessage {
            header: self.header,
            parent_header: self.parent_header,
            content: serde_json::to_value(&self.content).expect("KernelMessage JSON serialization"),
            buffers: self.buffers,
        }
    }
}

impl KernelMessage {
    /// Deserialize the content of the message into a specific type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<KernelMessage<T>, Error> {
        Ok(KernelMessage {
            header: self.header,
            parent_header: self.parent_header,
            content: serde_json::from_value(self.content)
                .map_err(|err| Error::DeserializeMessage(err.to_string()))?,
            buffers: self.buffers,
        })
    }
}

/// Completion status carried by an `execute_reply`.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// The request was processed successfully.
    Ok,

    /// The request failed due to an error.
    Error,

    /// The request was aborted before running, with no further information.
    ///
    /// Some kernels return "aborted" instead, see
    /// <https://github.com/ipython/ipykernel/issues/367> for details.
    #[serde(alias = "aborted")]
    Abort,
}

/// The reply to an execute request, reduced to the fields this server
/// records.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteReply {
    /// Completion status of the execution.
    pub status: ReplyStatus,

    /// The execution count, which increments with each request that stores
    /// history. Absent on some error replies.
    #[serde(default)]
    pub execution_count: Option<i32>,
}

/// Streams of output from the kernel, such as stdout and stderr.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StreamContent {
    /// The name of the stream, one of 'stdout' or 'stderr'.
    pub name: String,

    /// The text to be displayed in the stream.
    pub text: String,
}

/// Content of an error message or error reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorContent {
    /// The error name, such as 'NameError'.
    pub ename: String,

    /// The error message, such as 'NameError: name 'x' is not defined'.
    pub evalue: String,

    /// The traceback frames of the error as a list of strings.
    pub traceback: Vec<String>,
}

/// Data to be displayed in frontends, such as images or HTML.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DisplayDataContent {
    /// The data to be displayed, typically a MIME type and the data itself.
    pub data: serde_json::Map<String, serde_json::Value>,

    /// Metadata associated with the data, can be empty.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Results of a code execution, such as the output or return value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteResultContent {
    /// The execution count, which increments with each request that stores
    /// history.
    pub execution_count: i32,

    /// The data to be displayed, typically a MIME type and the data itself.
    /// A plain text representation should always be provided in the
    /// `text/plain` mime-type.
    pub data: serde_json::Map<String, serde_json::Value>,

    /// Metadata associated with the data, can be empty.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Request to clear output visible on the frontend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClearOutputContent {
    /// If true, the frontend should wait until the next output before
    /// clearing.
    pub wait: bool,
}
