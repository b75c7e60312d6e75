//! Contracts for reaching already-running kernels.
//!
//! The transport (ZeroMQ, WebSocket, gateway…) lives with the host server;
//! this module only fixes the client surface the execution stack drives:
//! submit code, stream back the resulting events, answer stdin prompts, and
//! shut channels down.

use std::sync::Arc;

use async_trait::async_trait;

use crate::wire_protocol::{ExecuteReply, KernelMessage};
use crate::Error;

/// Events surfaced while one execute request is in flight.
///
/// Iopub traffic arrives in kernel-emitted order, interleaved with at most
/// one stdin prompt at a time, and the stream ends with the shell reply.
#[derive(Clone, Debug)]
pub enum ExecuteEvent {
    /// An iopub broadcast attributable to the request (stream, display
    /// data, execution results, errors, clear-output…).
    Iopub(KernelMessage),

    /// The kernel asked the user for input on the stdin channel.
    InputRequest(KernelMessage),

    /// The terminal reply for the request on the shell channel.
    Reply(ExecuteReply),
}

/// An async client connected to a single running kernel.
#[async_trait]
pub trait KernelClient: Send + Sync {
    /// Whether code running on this kernel may prompt the user for input
    /// with an `input_request` message.
    fn allow_stdin(&self) -> bool;

    /// Attach the channel sockets if they are not connected yet.
    ///
    /// Gateway clients connect lazily on first use; directly connected
    /// clients can keep the default no-op.
    async fn start_channels(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Submit `code` for execution and stream back events until the shell
    /// reply.
    ///
    /// `session` tags the messages of this execution so that iopub traffic
    /// stays attributable to the originating request.
    async fn execute(
        &self,
        code: &str,
        session: &str,
    ) -> Result<async_channel::Receiver<ExecuteEvent>, Error>;

    /// Reply to an outstanding `input_request` on the stdin channel.
    async fn input(&self, value: &str) -> Result<(), Error>;

    /// Whether a message is already waiting on the stdin channel.
    async fn stdin_msg_ready(&self) -> bool;

    /// Whether a message is already waiting on the shell channel.
    async fn shell_msg_ready(&self) -> bool;

    /// Tear down every channel to the kernel.
    async fn stop_channels(&self);
}

/// The host server's view of its kernel pool.
#[async_trait]
pub trait KernelProvider: Send + Sync {
    /// Whether `kernel_id` refers to a kernel known to the server.
    fn has_kernel(&self, kernel_id: &str) -> bool;

    /// Connect a client to the kernel `kernel_id`.
    ///
    /// Returns [`Error::UnknownKernel`] when the id is not known and
    /// [`Error::KernelConnect`] when the kernel exists but cannot be
    /// reached.
    async fn connect(&self, kernel_id: &str) -> Result<Arc<dyn KernelClient>, Error>;
}
