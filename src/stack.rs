//! The execution stack: per-kernel FIFO scheduling of code execution.
//!
//! Submitting a snippet returns an opaque request id immediately. A lazily
//! spawned worker per kernel drives one execution at a time, so requests to
//! the same kernel complete strictly in submission order; across kernels no
//! ordering is guaranteed. Results are polled and consumed exactly once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::DocumentStore;
use crate::events::EventLogger;
use crate::kernels::{KernelClient, KernelProvider};
use crate::models::{ExecutionPoll, ExecutionRequest, PendingInput, RequestMetadata};
use crate::Error;

mod worker;

use worker::{kernel_worker, WorkerContext};

/// Bound on waiting for workers and queues while disposing the stack.
const DISPOSAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Stored state of a request slot.
#[derive(Clone, Debug)]
pub(crate) enum ResultSlot {
    /// The request was submitted but no result has been recorded yet.
    NotStarted,

    /// The request completed with a kernel reply.
    Done(crate::models::ExecutionOutcome),

    /// The worker failed while processing the request.
    Failed {
        /// Human-readable failure message.
        error: String,
    },
}

#[derive(Clone)]
struct RequestQueue {
    tx: async_channel::Sender<ExecutionRequest>,
    rx: async_channel::Receiver<ExecutionRequest>,
}

struct WorkerHandle {
    handle: JoinHandle<()>,
    token: CancellationToken,
}

/// Execution request stack.
///
/// Keeps track of the execution requests of every kernel. The result of a
/// request can be queried only once.
pub struct ExecutionStack {
    provider: Arc<dyn KernelProvider>,
    store: Option<Arc<dyn DocumentStore>>,
    events: EventLogger,
    /// Execution results per kernel id per execution request id.
    results: DashMap<String, Arc<DashMap<String, ResultSlot>>>,
    /// Cached kernel clients.
    clients: DashMap<String, Arc<dyn KernelClient>>,
    /// Pending input per kernel id.
    pending_inputs: DashMap<String, Arc<Mutex<PendingInput>>>,
    /// Queued execution requests, in order, per kernel id.
    queues: DashMap<String, RequestQueue>,
    /// Execution request queue worker per kernel id.
    workers: DashMap<String, WorkerHandle>,
}

impl ExecutionStack {
    /// Create a stack bound to a kernel provider and, optionally, a
    /// collaborative-document store.
    pub fn new(
        provider: Arc<dyn KernelProvider>,
        store: Option<Arc<dyn DocumentStore>>,
        events: EventLogger,
    ) -> Self {
        Self {
            provider,
            store,
            events,
            results: DashMap::new(),
            clients: DashMap::new(),
            pending_inputs: DashMap::new(),
            queues: DashMap::new(),
            workers: DashMap::new(),
        }
    }

    /// Whether `kernel_id` refers to a kernel known to the server.
    pub fn has_kernel(&self, kernel_id: &str) -> bool {
        self.provider.has_kernel(kernel_id)
    }

    /// The domain event logger of this stack.
    pub fn events(&self) -> &EventLogger {
        &self.events
    }

    /// Add an asynchronous execution request.
    ///
    /// The snippet is queued behind any previous request for the same
    /// kernel, and the per-kernel worker is spawned if it does not exist
    /// yet. Returns the request identifier to poll with [`Self::get`].
    pub async fn put(
        &self,
        kernel_id: &str,
        snippet: &str,
        metadata: RequestMetadata,
    ) -> Result<String, Error> {
        let request_id = Uuid::new_v4().to_string();

        // Make the stack aware the request exists before it is scheduled.
        let results = self.results.entry(kernel_id.to_string()).or_default().clone();
        results.insert(request_id.clone(), ResultSlot::NotStarted);
        let pending_input = self
            .pending_inputs
            .entry(kernel_id.to_string())
            .or_default()
            .clone();
        let queue = self
            .queues
            .entry(kernel_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = async_channel::unbounded();
                RequestQueue { tx, rx }
            })
            .clone();

        queue
            .tx
            .send(ExecutionRequest {
                request_id: request_id.clone(),
                snippet: snippet.to_string(),
                metadata,
            })
            .await
            .map_err(|_| Error::Disposed)?;

        if !self.workers.contains_key(kernel_id) {
            let client = self.get_client(kernel_id).await?;
            let ctx = WorkerContext {
                kernel_id: kernel_id.to_string(),
                client,
                store: self.store.clone(),
                events: self.events.clone(),
                queue: queue.rx.clone(),
                results,
                pending_input,
                token: CancellationToken::new(),
            };
            self.workers
                .entry(kernel_id.to_string())
                .or_insert_with(|| {
                    let token = ctx.token.clone();
                    WorkerHandle {
                        handle: tokio::spawn(kernel_worker(ctx)),
                        token,
                    }
                });
        }

        Ok(request_id)
    }

    /// Get the results of request `request_id`, its pending input, or
    /// [`ExecutionPoll::Pending`].
    ///
    /// Terminal values are removed when returned; a second poll for the
    /// same request is [`Error::UnknownRequest`].
    pub fn get(&self, kernel_id: &str, request_id: &str) -> Result<ExecutionPoll, Error> {
        let not_found = || Error::UnknownRequest {
            kernel_id: kernel_id.to_string(),
            request_id: request_id.to_string(),
        };
        let results = self.results.get(kernel_id).ok_or_else(not_found)?.clone();
        if !results.contains_key(request_id) {
            return Err(not_found());
        }

        if let Some(slot) = self.pending_inputs.get(kernel_id) {
            let pending = slot.lock().expect("pending input lock");
            if pending.is_pending() {
                info!(kernel_id, "kernel has a pending input");
                // Only the request that triggered the prompt may see it;
                // otherwise a later request still looking for its results
                // could capture the pending input.
                if let Some(content) = pending.for_request(request_id) {
                    return Ok(ExecutionPoll::InputRequired(content));
                }
            }
        }

        let terminal = {
            let slot = results.get(request_id).ok_or_else(not_found)?;
            !matches!(*slot, ResultSlot::NotStarted)
        };
        if !terminal {
            return Ok(ExecutionPoll::Pending);
        }
        match results.remove(request_id) {
            Some((_, ResultSlot::Done(outcome))) => Ok(ExecutionPoll::Done(outcome)),
            Some((_, ResultSlot::Failed { error })) => Ok(ExecutionPoll::Failed { error }),
            Some((_, ResultSlot::NotStarted)) | None => Ok(ExecutionPoll::Pending),
        }
    }

    /// Send the input `value` to the kernel `kernel_id`.
    pub async fn send_input(&self, kernel_id: &str, value: &str) -> Result<(), Error> {
        let client = self.get_client(kernel_id).await?;
        // Only send the stdin reply if there *was not* another request, or
        // the execution finished, while the user was typing.
        if !(client.stdin_msg_ready().await || client.shell_msg_ready().await) {
            client.input(value).await?;
            if let Some(slot) = self.pending_inputs.get(kernel_id) {
                slot.lock().expect("pending input lock").clear();
            }
        }
        Ok(())
    }

    /// Cancel execution for kernel `kernel_id`.
    ///
    /// Cancels the worker and awaits it under `timeout`, drains the request
    /// queue, then stops the cached client's channels. Each phase runs even
    /// if the previous one failed; the first error is returned.
    pub async fn cancel(&self, kernel_id: &str, timeout: Option<Duration>) -> Result<(), Error> {
        debug!(kernel_id, "cancelling execution");
        let worker_result = match self.workers.remove(kernel_id) {
            Some((_, worker)) => {
                worker.token.cancel();
                join_worker(worker.handle, timeout).await
            }
            None => Ok(()),
        };
        if let Some((_, queue)) = self.queues.remove(kernel_id) {
            queue.tx.close();
            while queue.rx.try_recv().is_ok() {}
        }
        if let Some((_, client)) = self.clients.remove(kernel_id) {
            client.stop_channels().await;
        }
        worker_result
    }

    /// Dispose of the stack: stop every worker, answer every pending input
    /// with an empty string so kernels don't hang, drain the queues, and
    /// stop every cached client.
    pub async fn dispose(&self) {
        debug!("disposing execution stack…");
        for entry in self.workers.iter() {
            entry.token.cancel();
        }

        let pending: Vec<String> = self
            .pending_inputs
            .iter()
            .filter(|entry| entry.lock().expect("pending input lock").is_pending())
            .map(|entry| entry.key().clone())
            .collect();
        for kernel_id in pending {
            if let Err(err) = self.send_input(&kernel_id, "").await {
                warn!(%kernel_id, error = %err, "could not answer pending input");
            }
        }
        self.pending_inputs.clear();

        let keys: Vec<String> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        let mut handles = Vec::new();
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                handles.push(worker.handle);
            }
        }
        if tokio::time::timeout(DISPOSAL_TIMEOUT, join_all(handles))
            .await
            .is_err()
        {
            warn!("timed out waiting for execution workers to stop");
        }
        self.workers.clear();

        let keys: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, queue)) = self.queues.remove(&key) {
                queue.tx.close();
                while queue.rx.try_recv().is_ok() {}
            }
        }
        self.queues.clear();

        let keys: Vec<String> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, client)) = self.clients.remove(&key) {
                client.stop_channels().await;
            }
        }
        self.clients.clear();
        self.results.clear();
        debug!("execution stack has been disposed");
    }

    /// Get the cached kernel client for `kernel_id`, connecting on first
    /// use.
    async fn get_client(&self, kernel_id: &str) -> Result<Arc<dyn KernelClient>, Error> {
        if let Some(client) = self.clients.get(kernel_id) {
            return Ok(client.clone());
        }
        let client = self.provider.connect(kernel_id).await?;
        self.clients.insert(kernel_id.to_string(), client.clone());
        Ok(client)
    }
}

impl Drop for ExecutionStack {
    fn drop(&mut self) {
        if !self.workers.is_empty()
            || !self.queues.is_empty()
            || !self.clients.is_empty()
            || !self.pending_inputs.is_empty()
        {
            warn!("dropping an active ExecutionStack; call `dispose` before dropping it");
        }
    }
}

async fn join_worker(handle: JoinHandle<()>, timeout: Option<Duration>) -> Result<(), Error> {
    let join = async {
        if let Err(err) = handle.await {
            if err.is_panic() {
                error!(error = %err, "execution worker panicked");
            }
        }
    };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, join)
            .await
            .map_err(|_| Error::Timeout("worker cancellation")),
        None => {
            join.await;
            Ok(())
        }
    }
}
