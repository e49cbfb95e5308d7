//! Host-side state machine for one worker process instance: handshake,
//! function-load bookkeeping, and the in-flight invocation map that joins
//! the send path to the receive loop.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use data_model::{
    ChannelState, FunctionId, FunctionMetadata, InvocationContext, InvocationId, InvocationResult,
    WorkerCapabilities, WorkerConfig, WorkerId,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    error::DispatchError,
    events::{ChannelReadyEvent, EventBus, WorkerErrorEvent, WorkerEvent},
    load_balancer::LoadBalancedChannel,
    process::{ExitStatus, ProcessConfig, ProcessDriver, WorkerProcessHandle},
    transport::{
        HostMessage, InvocationRequest, WorkerLogLevel, WorkerMessage, WorkerTransportFactory,
    },
};

pub type InvocationResultSender = oneshot::Sender<Result<InvocationResult, DispatchError>>;

struct PendingInvocation {
    function_id: FunctionId,
    result_tx: InvocationResultSender,
}

/// Point-in-time view of one channel, for host monitors.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub language: String,
    pub state: ChannelState,
    pub loaded_functions: usize,
    pub pending_invocations: usize,
    pub last_ready_at_ms: Option<u64>,
}

pub struct WorkerChannel {
    worker_id: WorkerId,
    language: String,
    config: WorkerConfig,
    host_addr: String,
    max_message_length: usize,
    event_bus: EventBus,

    state_tx: watch::Sender<ChannelState>,
    capabilities: RwLock<WorkerCapabilities>,
    loaded_functions: RwLock<HashSet<FunctionId>>,
    load_errors: RwLock<HashMap<FunctionId, String>>,
    pending: DashMap<InvocationId, PendingInvocation>,
    outbound: RwLock<Option<mpsc::Sender<HostMessage>>>,
    process: RwLock<Option<WorkerProcessHandle>>,
    last_ready_at_ms: AtomicU64,
    disposing: AtomicBool,
    terminal_event_published: AtomicBool,
}

impl WorkerChannel {
    fn new(
        config: WorkerConfig,
        host_addr: String,
        max_message_length: usize,
        event_bus: EventBus,
    ) -> Arc<Self> {
        let language = config.language().to_string();
        let (state_tx, _) = watch::channel(ChannelState::Starting);
        Arc::new(Self {
            worker_id: WorkerId::generate(),
            language,
            config,
            host_addr,
            max_message_length,
            event_bus,
            state_tx,
            capabilities: RwLock::new(WorkerCapabilities::default()),
            loaded_functions: RwLock::new(HashSet::new()),
            load_errors: RwLock::new(HashMap::new()),
            pending: DashMap::new(),
            outbound: RwLock::new(None),
            process: RwLock::new(None),
            last_ready_at_ms: AtomicU64::new(0),
            disposing: AtomicBool::new(false),
            terminal_event_published: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub fn is_ready_for_invocations(&self) -> bool {
        self.state() == ChannelState::Ready && !self.disposing.load(Ordering::SeqCst)
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        self.capabilities.read().unwrap().clone()
    }

    pub fn pending_invocations(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        self.config.count_options.process_shutdown_timeout()
    }

    pub fn status(&self) -> WorkerStatus {
        let last_ready = self.last_ready_at_ms.load(Ordering::Relaxed);
        WorkerStatus {
            worker_id: self.worker_id.clone(),
            language: self.language.clone(),
            state: self.state(),
            loaded_functions: self.loaded_functions.read().unwrap().len(),
            pending_invocations: self.pending.len(),
            last_ready_at_ms: if last_ready == 0 { None } else { Some(last_ready) },
        }
    }

    /// Launch the worker process and run the handshake. On success the
    /// channel is `Ready` and a `ChannelReady` event has been published.
    pub(crate) async fn start(
        self: &Arc<Self>,
        driver: &Arc<dyn ProcessDriver>,
        transports: &Arc<dyn WorkerTransportFactory>,
    ) -> Result<(), DispatchError> {
        let request_id = nanoid::nanoid!(12);
        let process_config = ProcessConfig {
            worker_id: self.worker_id.clone(),
            executable: self.config.description.executable_path.clone(),
            args: self.build_worker_args(&request_id),
            env: self
                .config
                .description
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            working_dir: self.config.description.working_directory.clone(),
        };

        let handle = match driver.start(process_config).await {
            Ok(handle) => handle,
            Err(err) => {
                let error = DispatchError::WorkerLaunchFailed {
                    language: self.language.clone(),
                    message: format!("{err:#}"),
                };
                self.transition(ChannelState::Errored);
                self.publish_worker_error(error.clone());
                return Err(error);
            }
        };
        let exited = handle.exited();
        *self.process.write().unwrap() = Some(handle);
        self.transition(ChannelState::WaitingForReady);

        let startup_timeout = self.config.count_options.process_startup_timeout();
        let pair = match tokio::time::timeout(startup_timeout, transports.connect(&self.worker_id))
            .await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                return Err(self.fail_handshake(DispatchError::WorkerChannelError {
                    worker_id: self.worker_id.clone(),
                    message: format!("transport attach failed: {err:#}"),
                }));
            }
            Err(_) => {
                return Err(self.fail_handshake(DispatchError::WorkerHandshakeTimeout {
                    worker_id: self.worker_id.clone(),
                    language: self.language.clone(),
                }));
            }
        };

        *self.outbound.write().unwrap() = Some(pair.outbound.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(self.clone().run_receive_loop(pair.inbound, exited, ready_tx));

        if let Err(err) = self
            .send_message(HostMessage::InitWorker {
                host_version: env!("CARGO_PKG_VERSION").to_string(),
                max_message_length: self.max_message_length,
            })
            .await
        {
            return Err(self.fail_handshake(DispatchError::WorkerChannelError {
                worker_id: self.worker_id.clone(),
                message: format!("failed to send init request: {err:#}"),
            }));
        }

        let init_timeout = self.config.count_options.worker_init_timeout();
        match tokio::time::timeout(init_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.fail_handshake(DispatchError::WorkerChannelError {
                worker_id: self.worker_id.clone(),
                message: "worker failed during handshake".to_string(),
            })),
            Err(_) => Err(self.fail_handshake(DispatchError::WorkerHandshakeTimeout {
                worker_id: self.worker_id.clone(),
                language: self.language.clone(),
            })),
        }
    }

    fn fail_handshake(&self, error: DispatchError) -> DispatchError {
        warn!(
            worker_id = %self.worker_id,
            language = %self.language,
            error = %error,
            "worker handshake failed"
        );
        self.kill_process();
        self.transition(ChannelState::Errored);
        self.publish_worker_error(error.clone());
        error
    }

    fn build_worker_args(&self, request_id: &str) -> Vec<String> {
        let description = &self.config.description;
        let mut args = description.arguments.clone();
        if let Some(worker_path) = &description.worker_path {
            args.push(worker_path.clone());
        }
        args.extend(description.worker_arguments.iter().cloned());
        args.push("--host".to_string());
        args.push(self.host_addr.clone());
        args.push("--worker-id".to_string());
        args.push(self.worker_id.get().to_string());
        args.push("--request-id".to_string());
        args.push(request_id.to_string());
        args.push("--max-message-length".to_string());
        args.push(self.max_message_length.to_string());
        args
    }

    async fn run_receive_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<WorkerMessage>,
        mut exited: watch::Receiver<Option<ExitStatus>>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let mut ready_tx = Some(ready_tx);
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_worker_message(message, &mut ready_tx),
                    None => {
                        self.on_transport_closed();
                        return;
                    }
                },
                changed = exited.changed() => {
                    let status = exited.borrow().clone();
                    if status.is_some() || changed.is_err() {
                        self.on_process_exited(status);
                        return;
                    }
                }
            }
        }
    }

    fn handle_worker_message(
        self: &Arc<Self>,
        message: WorkerMessage,
        ready_tx: &mut Option<oneshot::Sender<()>>,
    ) {
        match message {
            WorkerMessage::StartStream { .. } => {
                debug!(worker_id = %self.worker_id, "ignoring duplicate start-stream message");
            }
            WorkerMessage::WorkerReady {
                worker_version,
                capabilities,
            } => {
                if self.state() != ChannelState::WaitingForReady {
                    debug!(worker_id = %self.worker_id, "ignoring duplicate worker-ready message");
                    return;
                }
                *self.capabilities.write().unwrap() = capabilities.clone();
                self.last_ready_at_ms
                    .store(funcrun_utils::get_epoch_time_in_ms(), Ordering::Relaxed);
                self.transition(ChannelState::Ready);
                info!(
                    worker_id = %self.worker_id,
                    language = %self.language,
                    worker_version = %worker_version,
                    capabilities = capabilities.len(),
                    "worker channel ready"
                );
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
                self.event_bus
                    .publish(WorkerEvent::ChannelReady(ChannelReadyEvent {
                        worker_id: self.worker_id.clone(),
                        language: self.language.clone(),
                        capabilities,
                    }));
            }
            WorkerMessage::FunctionLoaded { function_id, error } => match error {
                None => {
                    debug!(
                        worker_id = %self.worker_id,
                        function_id = %function_id,
                        "worker acknowledged function load"
                    );
                    self.loaded_functions.write().unwrap().insert(function_id);
                }
                Some(message) => {
                    warn!(
                        worker_id = %self.worker_id,
                        function_id = %function_id,
                        error = %message,
                        "worker failed to load function"
                    );
                    self.load_errors
                        .write()
                        .unwrap()
                        .insert(function_id, message);
                }
            },
            WorkerMessage::InvocationResponse(response) => {
                match self.pending.remove(&response.invocation_id) {
                    Some((invocation_id, pending)) => {
                        let result = InvocationResult {
                            outputs: response.outputs,
                            return_value: response.return_value,
                            failure: response.failure,
                        };
                        if pending.result_tx.send(Ok(result)).is_err() {
                            debug!(
                                worker_id = %self.worker_id,
                                invocation_id = %invocation_id,
                                "discarding response for an abandoned invocation"
                            );
                        }
                    }
                    None => {
                        debug!(
                            worker_id = %self.worker_id,
                            invocation_id = %response.invocation_id,
                            "discarding response for an unknown invocation"
                        );
                    }
                }
            }
            WorkerMessage::Log {
                level,
                message,
                invocation_id,
            } => {
                let invocation_id = invocation_id.as_ref().map(|id| id.get().to_string());
                match level {
                    WorkerLogLevel::Trace | WorkerLogLevel::Debug => {
                        debug!(worker_id = %self.worker_id, invocation_id = ?invocation_id, "{message}")
                    }
                    WorkerLogLevel::Information => {
                        info!(worker_id = %self.worker_id, invocation_id = ?invocation_id, "{message}")
                    }
                    WorkerLogLevel::Warning => {
                        warn!(worker_id = %self.worker_id, invocation_id = ?invocation_id, "{message}")
                    }
                    WorkerLogLevel::Error => {
                        tracing::error!(worker_id = %self.worker_id, invocation_id = ?invocation_id, "{message}")
                    }
                }
            }
        }
    }

    fn on_transport_closed(&self) {
        if self.disposing.load(Ordering::SeqCst) {
            self.transition(ChannelState::Closed);
            return;
        }
        let error = DispatchError::WorkerChannelError {
            worker_id: self.worker_id.clone(),
            message: "worker transport stream closed".to_string(),
        };
        warn!(worker_id = %self.worker_id, language = %self.language, "worker transport stream closed");
        self.kill_process();
        self.transition(ChannelState::Errored);
        self.fail_pending(&error);
        self.publish_worker_error(error);
    }

    fn on_process_exited(&self, status: Option<ExitStatus>) {
        let exit_code = status.as_ref().and_then(|s| s.code);
        self.event_bus.publish(WorkerEvent::ProcessExited {
            worker_id: self.worker_id.clone(),
            exit_code,
        });
        if self.disposing.load(Ordering::SeqCst) {
            self.transition(ChannelState::Closed);
            return;
        }

        self.transition(ChannelState::Errored);
        if status.as_ref().is_some_and(|s| s.is_restart_request()) {
            info!(
                worker_id = %self.worker_id,
                language = %self.language,
                "worker requested an intentional restart"
            );
            self.fail_pending(&DispatchError::WorkerChannelError {
                worker_id: self.worker_id.clone(),
                message: "worker exited for an intentional restart".to_string(),
            });
            if !self.terminal_event_published.swap(true, Ordering::SeqCst) {
                self.event_bus.publish(WorkerEvent::WorkerRestartRequested {
                    worker_id: self.worker_id.clone(),
                    language: self.language.clone(),
                });
            }
            return;
        }

        let mut message = format!("worker process exited unexpectedly (exit code {exit_code:?})");
        let stderr_tail = self
            .process
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.stderr_tail())
            .unwrap_or_default();
        if !stderr_tail.is_empty() {
            message.push_str(": ");
            message.push_str(&stderr_tail.join(" | "));
        }
        let error = DispatchError::WorkerChannelError {
            worker_id: self.worker_id.clone(),
            message,
        };
        warn!(
            worker_id = %self.worker_id,
            language = %self.language,
            exit_code = ?exit_code,
            "worker process exited unexpectedly"
        );
        self.fail_pending(&error);
        self.publish_worker_error(error);
    }

    /// Send one load request per registered function of this language, so
    /// the worker can load them before serving invocations.
    pub(crate) async fn send_function_load_requests(&self, functions: &[FunctionMetadata]) {
        for function in functions.iter().filter(|f| f.language == self.language) {
            debug!(
                worker_id = %self.worker_id,
                function_id = %function.function_id,
                function_name = %function.name,
                "sending function load request"
            );
            if let Err(err) = self
                .send_message(HostMessage::LoadFunction {
                    function: function.clone(),
                })
                .await
            {
                warn!(
                    worker_id = %self.worker_id,
                    error = %err,
                    "failed to send function load request"
                );
                return;
            }
        }
    }

    /// Dispatch one invocation. The result is delivered through
    /// `result_tx`; a recorded load failure for the function is replayed
    /// without touching the worker.
    pub(crate) async fn send_invocation(
        &self,
        context: InvocationContext,
        result_tx: InvocationResultSender,
    ) {
        if let Some(message) = self
            .load_errors
            .read()
            .unwrap()
            .get(&context.function_id)
            .cloned()
        {
            let _ = result_tx.send(Err(DispatchError::FunctionLoadFailed {
                worker_id: self.worker_id.clone(),
                function_id: context.function_id.clone(),
                message,
            }));
            return;
        }

        let invocation_id = context.invocation_id.clone();
        self.pending.insert(
            invocation_id.clone(),
            PendingInvocation {
                function_id: context.function_id.clone(),
                result_tx,
            },
        );
        let request = InvocationRequest::from(context);
        if let Err(err) = self.send_message(HostMessage::Invoke { invocation: request }).await {
            if let Some((_, pending)) = self.pending.remove(&invocation_id) {
                let _ = pending.result_tx.send(Err(DispatchError::WorkerChannelError {
                    worker_id: self.worker_id.clone(),
                    message: format!("failed to send invocation: {err:#}"),
                }));
            }
        } else {
            debug!(
                worker_id = %self.worker_id,
                invocation_id = %invocation_id,
                "posted invocation to worker"
            );
        }
    }

    async fn send_message(&self, message: HostMessage) -> Result<()> {
        let outbound = self
            .outbound
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("transport not attached"))?;
        outbound
            .send(message)
            .await
            .map_err(|_| anyhow!("transport stream closed"))
    }

    /// Wait until in-flight invocations complete, bounded by `grace`.
    pub(crate) async fn drain(&self, grace: Duration) {
        if self.pending.is_empty() {
            return;
        }
        debug!(
            worker_id = %self.worker_id,
            pending = self.pending.len(),
            "draining in-flight invocations"
        );
        let deadline = tokio::time::Instant::now() + grace;
        while !self.pending.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Graceful close: drain, send a close notice, kill the process.
    /// Idempotent.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(worker_id = %self.worker_id, language = %self.language, "shutting down worker channel");
        self.drain(grace).await;
        let _ = self.send_message(HostMessage::CloseStream).await;
        *self.outbound.write().unwrap() = None;
        self.kill_process();
        self.transition(ChannelState::Closed);
        self.fail_pending(&DispatchError::ShuttingDown);
    }

    fn kill_process(&self) {
        if let Some(process) = self.process.read().unwrap().as_ref() {
            process.kill();
        }
    }

    fn fail_pending(&self, error: &DispatchError) {
        let invocation_ids: Vec<InvocationId> =
            self.pending.iter().map(|entry| entry.key().clone()).collect();
        for invocation_id in invocation_ids {
            if let Some((_, pending)) = self.pending.remove(&invocation_id) {
                debug!(
                    worker_id = %self.worker_id,
                    invocation_id = %invocation_id,
                    function_id = %pending.function_id,
                    "failing in-flight invocation"
                );
                let _ = pending.result_tx.send(Err(error.clone()));
            }
        }
    }

    fn publish_worker_error(&self, error: DispatchError) {
        if self.terminal_event_published.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.disposing.load(Ordering::SeqCst) {
            return;
        }
        self.event_bus
            .publish(WorkerEvent::WorkerError(WorkerErrorEvent {
                worker_id: self.worker_id.clone(),
                language: self.language.clone(),
                error,
                timestamp_ms: funcrun_utils::get_epoch_time_in_ms(),
            }));
    }

    fn transition(&self, next: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            let allowed = match *current {
                ChannelState::Closed => false,
                ChannelState::Errored => next == ChannelState::Closed,
                _ => true,
            };
            if !allowed {
                return false;
            }
            debug!(
                worker_id = %self.worker_id,
                from = current.as_ref(),
                to = next.as_ref(),
                "worker channel state transition"
            );
            *current = next;
            true
        });
    }
}

impl LoadBalancedChannel for WorkerChannel {
    fn has_loaded_function(&self, function_id: &FunctionId) -> bool {
        self.loaded_functions.read().unwrap().contains(function_id)
    }
}

/// Creates and starts channels; holds the pieces every channel needs (the
/// process driver, the transport factory, the bus, and per-language
/// configuration).
pub struct WorkerChannelFactory {
    driver: Arc<dyn ProcessDriver>,
    transports: Arc<dyn WorkerTransportFactory>,
    event_bus: EventBus,
    worker_configs: HashMap<String, WorkerConfig>,
    host_addr: String,
    max_message_length: usize,
}

impl WorkerChannelFactory {
    pub fn new(
        driver: Arc<dyn ProcessDriver>,
        transports: Arc<dyn WorkerTransportFactory>,
        event_bus: EventBus,
        worker_configs: Vec<WorkerConfig>,
        host_addr: String,
        max_message_length: usize,
    ) -> Self {
        let worker_configs = worker_configs
            .into_iter()
            .map(|c| (c.language().to_string(), c))
            .collect();
        Self {
            driver,
            transports,
            event_bus,
            worker_configs,
            host_addr,
            max_message_length,
        }
    }

    pub fn worker_config(&self, language: &str) -> Option<&WorkerConfig> {
        self.worker_configs.get(language)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub(crate) fn create(&self, language: &str) -> Result<Arc<WorkerChannel>, DispatchError> {
        let config = self.worker_configs.get(language).ok_or_else(|| {
            DispatchError::WorkerLaunchFailed {
                language: language.to_string(),
                message: "no worker configuration for language".to_string(),
            }
        })?;
        Ok(WorkerChannel::new(
            config.clone(),
            self.host_addr.clone(),
            self.max_message_length,
            self.event_bus.clone(),
        ))
    }

    pub(crate) async fn start(&self, channel: &Arc<WorkerChannel>) -> Result<(), DispatchError> {
        channel.start(&self.driver, &self.transports).await
    }
}
