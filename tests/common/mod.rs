//! Test doubles for the kernel and collaboration contracts.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use nbexec::collab::{CellState, CollabDocument, DocumentStore};
use nbexec::kernels::{ExecuteEvent, KernelClient, KernelProvider};
use nbexec::wire_protocol::{ExecuteReply, KernelMessage, KernelMessageType, ReplyStatus};
use nbexec::Error;

/// Install the log subscriber for a test, tolerating repeated calls.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One step of a scripted execution.
pub enum Step {
    /// Emit an iopub message of the given type with the given content.
    Iopub(KernelMessageType, Value),

    /// Sleep, keeping the execution observably in flight.
    Pause(Duration),

    /// Emit an `input_request` with this prompt and wait for `input()`;
    /// the received value is echoed back as an `execute_result`.
    AwaitInput { prompt: String, password: bool },

    /// Finish with the shell reply.
    Reply {
        status: ReplyStatus,
        execution_count: Option<i32>,
    },
}

/// A kernel client that plays one pre-recorded script per execution.
pub struct ScriptedKernel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    input_tx: async_channel::Sender<String>,
    input_rx: async_channel::Receiver<String>,
    pub allow_stdin: bool,
    pub stop_calls: AtomicUsize,
    pub inputs: Mutex<Vec<String>>,
    /// Simulates a message already waiting on the stdin channel.
    pub stdin_ready: AtomicBool,
    /// Simulates a message already waiting on the shell channel.
    pub shell_ready: AtomicBool,
}

impl ScriptedKernel {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        let (input_tx, input_rx) = async_channel::unbounded();
        Self {
            scripts: Mutex::new(scripts.into()),
            input_tx,
            input_rx,
            allow_stdin: true,
            stop_calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            stdin_ready: AtomicBool::new(false),
            shell_ready: AtomicBool::new(false),
        }
    }

    /// Queue another script behind the existing ones.
    pub fn push_script(&self, script: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Script for a snippet that prints `text` on stdout and succeeds.
    pub fn print_script(text: &str, execution_count: i32) -> Vec<Step> {
        vec![
            Step::Iopub(
                KernelMessageType::Stream,
                json!({"name": "stdout", "text": text}),
            ),
            Step::Reply {
                status: ReplyStatus::Ok,
                execution_count: Some(execution_count),
            },
        ]
    }

    /// Script for a snippet with no output, like an assignment.
    pub fn silent_script(execution_count: i32) -> Vec<Step> {
        vec![Step::Reply {
            status: ReplyStatus::Ok,
            execution_count: Some(execution_count),
        }]
    }

    /// Script for a snippet raising an exception.
    pub fn error_script(ename: &str, evalue: &str, execution_count: i32) -> Vec<Step> {
        vec![
            Step::Iopub(
                KernelMessageType::Error,
                json!({
                    "ename": ename,
                    "evalue": evalue,
                    "traceback": [format!("{ename}: {evalue}")],
                }),
            ),
            Step::Reply {
                status: ReplyStatus::Error,
                execution_count: Some(execution_count),
            },
        ]
    }

    /// Script for a snippet calling `input(prompt)`.
    pub fn input_script(prompt: &str, execution_count: i32) -> Vec<Step> {
        vec![
            Step::AwaitInput {
                prompt: prompt.into(),
                password: false,
            },
            Step::Reply {
                status: ReplyStatus::Ok,
                execution_count: Some(execution_count),
            },
        ]
    }
}

#[async_trait]
impl KernelClient for ScriptedKernel {
    fn allow_stdin(&self) -> bool {
        self.allow_stdin
    }

    async fn execute(
        &self,
        _code: &str,
        _session: &str,
    ) -> Result<async_channel::Receiver<ExecuteEvent>, Error> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(Error::KernelDisconnect)?;
        let (tx, rx) = async_channel::unbounded();
        let input_rx = self.input_rx.clone();
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Iopub(msg_type, content) => {
                        let msg = KernelMessage::new(msg_type, content);
                        if tx.send(ExecuteEvent::Iopub(msg)).await.is_err() {
                            return;
                        }
                    }
                    Step::Pause(duration) => tokio::time::sleep(duration).await,
                    Step::AwaitInput { prompt, password } => {
                        let msg = KernelMessage::new(
                            KernelMessageType::InputRequest,
                            json!({"prompt": prompt, "password": password}),
                        );
                        if tx.send(ExecuteEvent::InputRequest(msg)).await.is_err() {
                            return;
                        }
                        let Ok(value) = input_rx.recv().await else {
                            return;
                        };
                        let msg = KernelMessage::new(
                            KernelMessageType::ExecuteResult,
                            json!({
                                "execution_count": 1,
                                "data": {"text/plain": format!("'{value}'")},
                                "metadata": {},
                            }),
                        );
                        if tx.send(ExecuteEvent::Iopub(msg)).await.is_err() {
                            return;
                        }
                    }
                    Step::Reply {
                        status,
                        execution_count,
                    } => {
                        let reply = ExecuteReply {
                            status,
                            execution_count,
                        };
                        if tx.send(ExecuteEvent::Reply(reply)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn input(&self, value: &str) -> Result<(), Error> {
        self.inputs.lock().unwrap().push(value.to_string());
        self.input_tx
            .send(value.to_string())
            .await
            .map_err(|_| Error::KernelDisconnect)
    }

    async fn stdin_msg_ready(&self) -> bool {
        self.stdin_ready.load(Ordering::SeqCst)
    }

    async fn shell_msg_ready(&self) -> bool {
        self.shell_ready.load(Ordering::SeqCst)
    }

    async fn stop_channels(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// A provider serving a fixed pool of scripted kernels.
#[derive(Default)]
pub struct TestKernelPool {
    kernels: Mutex<HashMap<String, Arc<ScriptedKernel>>>,
}

impl TestKernelPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kernel_id: &str, kernel: Arc<ScriptedKernel>) {
        self.kernels
            .lock()
            .unwrap()
            .insert(kernel_id.to_string(), kernel);
    }
}

#[async_trait]
impl KernelProvider for TestKernelPool {
    fn has_kernel(&self, kernel_id: &str) -> bool {
        self.kernels.lock().unwrap().contains_key(kernel_id)
    }

    async fn connect(&self, kernel_id: &str) -> Result<Arc<dyn KernelClient>, Error> {
        let kernel = self
            .kernels
            .lock()
            .unwrap()
            .get(kernel_id)
            .cloned()
            .ok_or_else(|| Error::UnknownKernel(kernel_id.to_string()))?;
        Ok(kernel)
    }
}

/// A collaborative document backed by a plain mutex.
pub struct SharedDocument {
    cells: Mutex<Vec<CellState>>,
}

impl SharedDocument {
    pub fn new(cells: Vec<CellState>) -> Self {
        Self {
            cells: Mutex::new(cells),
        }
    }

    pub fn snapshot(&self) -> Vec<CellState> {
        self.cells.lock().unwrap().clone()
    }
}

impl CollabDocument for SharedDocument {
    fn transact(&self, f: &mut dyn FnMut(&mut Vec<CellState>)) {
        let mut cells = self.cells.lock().unwrap();
        f(&mut cells);
    }
}

/// A document store serving documents by room id.
#[derive(Default)]
pub struct TestDocumentStore {
    documents: Mutex<HashMap<String, Arc<SharedDocument>>>,
}

impl TestDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, room_id: &str, document: Arc<SharedDocument>) {
        self.documents
            .lock()
            .unwrap()
            .insert(room_id.to_string(), document);
    }
}

#[async_trait]
impl DocumentStore for TestDocumentStore {
    async fn get_document(&self, room_id: &str) -> Option<Arc<dyn CollabDocument>> {
        let document = self.documents.lock().unwrap().get(room_id).cloned()?;
        Some(document)
    }
}

/// A fresh code cell with the given id.
pub fn code_cell(id: &str) -> CellState {
    CellState {
        id: id.into(),
        cell_type: "code".into(),
        source: String::new(),
        outputs: vec![],
        execution_count: None,
        execution_state: String::new(),
        metadata: serde_json::Map::new(),
    }
}
