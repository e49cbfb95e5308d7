//! Test doubles: a mock process driver with controllable exits and a
//! scripted in-memory worker transport.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{
    InvocationFailure, InvocationId, WorkerCapabilities, WorkerConfig, WorkerId,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::WorkerChannelFactory,
    channel_manager::{ChannelManagerScope, WorkerChannelManager},
    dispatcher::{DispatcherOptions, FunctionDispatcher},
    events::EventBus,
    process::{ExitStatus, ProcessConfig, ProcessDriver, WorkerProcessHandle},
    transport::{
        HostMessage, InvocationResponse, TransportPair, WorkerMessage, WorkerTransportFactory,
    },
};

/// Process driver that never spawns anything; exits are triggered by the
/// test.
pub(crate) struct MockProcessDriver {
    start_count: AtomicUsize,
    fail_next_starts: AtomicUsize,
    exits: Mutex<HashMap<WorkerId, Arc<watch::Sender<Option<ExitStatus>>>>>,
}

impl MockProcessDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_count: AtomicUsize::new(0),
            fail_next_starts: AtomicUsize::new(0),
            exits: Mutex::new(HashMap::new()),
        })
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn fail_next_starts(&self, count: usize) {
        self.fail_next_starts.store(count, Ordering::SeqCst);
    }

    /// Simulate the worker process exiting with the given code.
    pub fn trigger_exit(&self, worker_id: &WorkerId, code: Option<i32>) -> bool {
        match self.exits.lock().unwrap().get(worker_id) {
            Some(tx) => tx.send(Some(ExitStatus { code })).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ProcessDriver for MockProcessDriver {
    async fn start(&self, config: ProcessConfig) -> Result<WorkerProcessHandle> {
        let remaining = self.fail_next_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_starts.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("mock launch failure");
        }
        self.start_count.fetch_add(1, Ordering::SeqCst);

        let (handle, exit_tx, kill_token) = WorkerProcessHandle::for_testing(config.worker_id.clone());
        let exit_tx = Arc::new(exit_tx);
        self.exits
            .lock()
            .unwrap()
            .insert(config.worker_id.clone(), exit_tx.clone());
        // a killed mock process dies signal-style (no exit code)
        tokio::spawn(async move {
            kill_token.cancelled().await;
            let _ = exit_tx.send(Some(ExitStatus { code: None }));
        });
        Ok(handle)
    }
}

#[derive(Clone)]
pub(crate) enum FakeResponse {
    /// Echo the inputs back as outputs.
    Echo,
    /// Report a business-logic failure.
    Fail(String),
    /// Respond only when the test calls `FakeWorkerHandle::respond`.
    Manual,
}

/// Behavior template applied to every fake worker the factory creates.
#[derive(Clone)]
pub(crate) struct FakeWorkerScript {
    pub handshake_delay: Duration,
    pub complete_handshake: bool,
    pub ack_loads: bool,
    /// function id -> load error message
    pub load_failures: HashMap<String, String>,
    pub response: FakeResponse,
    pub response_delay: Duration,
}

impl Default for FakeWorkerScript {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::ZERO,
            complete_handshake: true,
            ack_loads: true,
            load_failures: HashMap::new(),
            response: FakeResponse::Echo,
            response_delay: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub(crate) struct FakeWorkerHandle {
    pub worker_id: WorkerId,
    received: Arc<Mutex<Vec<InvocationId>>>,
    kill: CancellationToken,
    respond_tx: mpsc::UnboundedSender<InvocationId>,
}

impl FakeWorkerHandle {
    /// Tear down the worker side of the stream, as a crashed worker would.
    pub fn kill_transport(&self) {
        self.kill.cancel();
    }

    /// Send a (possibly late) response for an invocation id.
    pub fn respond(&self, invocation_id: InvocationId) {
        let _ = self.respond_tx.send(invocation_id);
    }

    pub fn received_invocations(&self) -> Vec<InvocationId> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

/// Transport factory that wires every channel to a scripted fake worker.
pub(crate) struct InMemoryTransportFactory {
    script: Mutex<FakeWorkerScript>,
    workers: Mutex<Vec<FakeWorkerHandle>>,
}

impl InMemoryTransportFactory {
    pub fn new(script: FakeWorkerScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Change the behavior applied to workers attached from now on.
    pub fn set_script(&self, script: FakeWorkerScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn workers(&self) -> Vec<FakeWorkerHandle> {
        self.workers.lock().unwrap().clone()
    }

    pub fn latest_worker(&self) -> Option<FakeWorkerHandle> {
        self.workers.lock().unwrap().last().cloned()
    }

    pub fn total_received(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.received_count())
            .sum()
    }
}

#[async_trait]
impl WorkerTransportFactory for InMemoryTransportFactory {
    async fn connect(&self, worker_id: &WorkerId) -> Result<TransportPair> {
        let script = self.script.lock().unwrap().clone();
        let (outbound_tx, outbound_rx) = mpsc::channel::<HostMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<WorkerMessage>(64);
        let received = Arc::new(Mutex::new(Vec::new()));
        let kill = CancellationToken::new();
        let (respond_tx, respond_rx) = mpsc::unbounded_channel();

        let handle = FakeWorkerHandle {
            worker_id: worker_id.clone(),
            received: received.clone(),
            kill: kill.clone(),
            respond_tx,
        };
        self.workers.lock().unwrap().push(handle);

        tokio::spawn(run_fake_worker(
            script, outbound_rx, inbound_tx, received, kill, respond_rx,
        ));
        Ok(TransportPair {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

async fn run_fake_worker(
    script: FakeWorkerScript,
    mut host_rx: mpsc::Receiver<HostMessage>,
    worker_tx: mpsc::Sender<WorkerMessage>,
    received: Arc<Mutex<Vec<InvocationId>>>,
    kill: CancellationToken,
    mut respond_rx: mpsc::UnboundedReceiver<InvocationId>,
) {
    loop {
        tokio::select! {
            _ = kill.cancelled() => return,
            manual = respond_rx.recv() => {
                if let Some(invocation_id) = manual {
                    let _ = worker_tx
                        .send(WorkerMessage::InvocationResponse(InvocationResponse {
                            invocation_id,
                            outputs: HashMap::new(),
                            return_value: Some(json!("late")),
                            failure: None,
                        }))
                        .await;
                }
            }
            message = host_rx.recv() => match message {
                None | Some(HostMessage::CloseStream) => return,
                Some(HostMessage::InitWorker { .. }) => {
                    if script.complete_handshake {
                        if !script.handshake_delay.is_zero() {
                            tokio::time::sleep(script.handshake_delay).await;
                        }
                        let _ = worker_tx
                            .send(WorkerMessage::WorkerReady {
                                worker_version: "9.9.0-test".to_string(),
                                capabilities: WorkerCapabilities::default(),
                            })
                            .await;
                    }
                }
                Some(HostMessage::LoadFunction { function }) => {
                    if script.ack_loads {
                        let error = script.load_failures.get(function.function_id.get()).cloned();
                        let _ = worker_tx
                            .send(WorkerMessage::FunctionLoaded {
                                function_id: function.function_id,
                                error,
                            })
                            .await;
                    }
                }
                Some(HostMessage::Invoke { invocation }) => {
                    received.lock().unwrap().push(invocation.invocation_id.clone());
                    if !script.response_delay.is_zero() {
                        tokio::time::sleep(script.response_delay).await;
                    }
                    match &script.response {
                        FakeResponse::Echo => {
                            let outputs = invocation
                                .inputs
                                .iter()
                                .map(|input| (input.name.clone(), input.value.clone()))
                                .collect();
                            let _ = worker_tx
                                .send(WorkerMessage::InvocationResponse(InvocationResponse {
                                    invocation_id: invocation.invocation_id,
                                    outputs,
                                    return_value: Some(json!("ok")),
                                    failure: None,
                                }))
                                .await;
                        }
                        FakeResponse::Fail(message) => {
                            let _ = worker_tx
                                .send(WorkerMessage::InvocationResponse(InvocationResponse {
                                    invocation_id: invocation.invocation_id,
                                    outputs: HashMap::new(),
                                    return_value: None,
                                    failure: Some(InvocationFailure {
                                        message: message.clone(),
                                        stack_trace: None,
                                    }),
                                }))
                                .await;
                        }
                        FakeResponse::Manual => {}
                    }
                }
            }
        }
    }
}

pub(crate) struct TestHost {
    pub dispatcher: Arc<FunctionDispatcher>,
    pub driver: Arc<MockProcessDriver>,
    pub transports: Arc<InMemoryTransportFactory>,
    pub webhost: Arc<WorkerChannelManager>,
    pub jobhost: Arc<WorkerChannelManager>,
}

pub(crate) fn build_test_host(
    worker_configs: Vec<WorkerConfig>,
    script: FakeWorkerScript,
) -> TestHost {
    let driver = MockProcessDriver::new();
    let transports = InMemoryTransportFactory::new(script);
    let factory = Arc::new(WorkerChannelFactory::new(
        driver.clone() as Arc<dyn ProcessDriver>,
        transports.clone() as Arc<dyn WorkerTransportFactory>,
        EventBus::new(),
        worker_configs,
        "127.0.0.1:0".to_string(),
        1024 * 1024,
    ));
    let webhost = WorkerChannelManager::new(ChannelManagerScope::WebHost, factory.clone());
    let jobhost = WorkerChannelManager::new(ChannelManagerScope::JobHost, factory.clone());
    let dispatcher = FunctionDispatcher::new(
        factory,
        webhost.clone(),
        jobhost.clone(),
        DispatcherOptions {
            initialization_timeout: Duration::from_secs(5),
        },
    );
    TestHost {
        dispatcher,
        driver,
        transports,
        webhost,
        jobhost,
    }
}

/// Poll until `predicate` holds, panicking after `timeout`.
pub(crate) async fn wait_until<F: Fn() -> bool>(timeout: Duration, what: &str, predicate: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
