//! Asynchronous code execution extension for Jupyter-style kernel servers.
//!
//! This crate is the middleware between clients that submit code snippets
//! addressed to a particular kernel and a pool of already-running kernels
//! reachable through a message-based client interface. Submitting a snippet
//! returns an opaque request id immediately; a per-kernel worker executes
//! requests one at a time in submission order, and the result is retrieved
//! by polling until it is consumed.
//!
//! The heart of the crate is the [`stack::ExecutionStack`]. Around it sit
//! the kernel client contracts ([`kernels`]), the notebook output
//! transformer ([`outputs`]), mirroring of execution state into live
//! collaborative documents ([`collab`]), domain events ([`events`]), and
//! the HTTP surface ([`handlers`]) mounted by the host server through
//! [`extension::Extension`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collab;
pub mod events;
pub mod extension;
pub mod handlers;
pub mod kernels;
pub mod models;
pub mod outputs;
pub mod stack;
pub mod wire_protocol;

/// Errors surfaced by the execution stack and its collaborator contracts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel id is not known to the server.
    #[error("unknown kernel with id: {0}")]
    UnknownKernel(String),

    /// The request slot does not exist: it was never created, or its result
    /// has already been consumed.
    #[error("execution request {request_id} for kernel {kernel_id} does not exist")]
    UnknownRequest {
        /// The kernel the request was addressed to.
        kernel_id: String,
        /// The polled request id.
        request_id: String,
    },

    /// Could not connect to the kernel.
    #[error("could not connect to the kernel: {0}")]
    KernelConnect(String),

    /// Disconnected while communicating with a kernel.
    #[error("disconnected from the kernel")]
    KernelDisconnect,

    /// Error while deserializing a message.
    #[error("could not deserialize message: {0}")]
    DeserializeMessage(String),

    /// The referenced collaborative cell exists but is not a code cell.
    #[error("cell {cell_id} of document {document_id} is not of type code")]
    NotCodeCell {
        /// The collaborative document containing the cell.
        document_id: String,
        /// The referenced cell.
        cell_id: String,
    },

    /// The execution stack has been disposed and no longer accepts work.
    #[error("the execution stack has been disposed")]
    Disposed,

    /// A cancellation or disposal phase overran its timeout.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
