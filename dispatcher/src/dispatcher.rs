//! The function dispatcher: owns the host-readiness state machine,
//! per-function invocation buffers, channel supervision and the restart
//! policy. Buffering never waits on a worker; flushing runs on its own
//! task and only while the dispatcher is `Initialized`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use data_model::{
    DispatcherState, FunctionId, FunctionMetadata, InvocationContext, InvocationId,
    InvocationResult,
};
use rand::Rng;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{InvocationResultSender, WorkerChannel, WorkerChannelFactory, WorkerStatus},
    channel_manager::WorkerChannelManager,
    error::DispatchError,
    events::{ChannelReadyEvent, EventBus, WorkerEvent},
    load_balancer::RoundRobinLoadBalancer,
};

const MAX_RESTART_JITTER_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Bound on `initialize` waiting for the first ready channel per
    /// language.
    pub initialization_timeout: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(90),
        }
    }
}

struct BufferedInvocation {
    context: InvocationContext,
    result_tx: InvocationResultSender,
    cancel: CancellationToken,
}

struct FunctionRegistration {
    metadata: FunctionMetadata,
    buffer: Mutex<VecDeque<BufferedInvocation>>,
}

/// Handle to one accepted invocation. Await [`PendingResult::wait`] for
/// the outcome; drop it or cancel the token to abandon the call (a late
/// worker response is then discarded).
#[derive(Debug)]
pub struct PendingResult {
    invocation_id: InvocationId,
    result_rx: oneshot::Receiver<Result<InvocationResult, DispatchError>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl PendingResult {
    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    /// Token that removes the invocation from its buffer (when still
    /// queued) or abandons the in-flight call.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<InvocationResult, DispatchError> {
        let PendingResult {
            invocation_id,
            result_rx,
            timeout,
            cancel,
        } = self;
        tokio::select! {
            result = result_rx => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::InvocationCancelled { invocation_id }),
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                Err(DispatchError::InvocationTimeout { invocation_id })
            }
            _ = cancel.cancelled() => Err(DispatchError::InvocationCancelled { invocation_id }),
        }
    }
}

pub struct FunctionDispatcher {
    options: DispatcherOptions,
    factory: Arc<WorkerChannelFactory>,
    webhost_manager: Arc<WorkerChannelManager>,
    jobhost_manager: Arc<WorkerChannelManager>,
    event_bus: EventBus,
    load_balancer: RoundRobinLoadBalancer,

    state_tx: watch::Sender<DispatcherState>,
    functions: RwLock<HashMap<FunctionId, Arc<FunctionRegistration>>>,
    registered_languages: RwLock<HashSet<String>>,
    /// Worker-error timestamps (epoch ms) per language; cleared when the
    /// newest error is older than the window.
    error_buckets: Mutex<HashMap<String, Vec<u64>>>,
    exhausted_languages: Mutex<HashSet<String>>,
    flush_notify: Arc<Notify>,
    restart_lock: tokio::sync::Mutex<()>,
    shutdown_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl FunctionDispatcher {
    pub fn new(
        factory: Arc<WorkerChannelFactory>,
        webhost_manager: Arc<WorkerChannelManager>,
        jobhost_manager: Arc<WorkerChannelManager>,
        options: DispatcherOptions,
    ) -> Arc<Self> {
        let event_bus = factory.event_bus().clone();
        let events_rx = event_bus.subscribe();
        let (state_tx, _) = watch::channel(DispatcherState::Default);
        let dispatcher = Arc::new(Self {
            options,
            factory,
            webhost_manager,
            jobhost_manager,
            event_bus,
            load_balancer: RoundRobinLoadBalancer::new(),
            state_tx,
            functions: RwLock::new(HashMap::new()),
            registered_languages: RwLock::new(HashSet::new()),
            error_buckets: Mutex::new(HashMap::new()),
            exhausted_languages: Mutex::new(HashSet::new()),
            flush_notify: Arc::new(Notify::new()),
            restart_lock: tokio::sync::Mutex::new(()),
            shutdown_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(dispatcher.clone().run_event_loop(events_rx));
        tokio::spawn(dispatcher.clone().run_flush_loop());
        dispatcher
    }

    pub fn state(&self) -> DispatcherState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<DispatcherState> {
        self.state_tx.subscribe()
    }

    /// Subscription point for host-level observers; off the dispatch path.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_bus.subscribe()
    }

    /// Snapshot of every tracked channel, for host monitors.
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .webhost_manager
            .all_channels()
            .iter()
            .chain(self.jobhost_manager.all_channels().iter())
            .map(|c| c.status())
            .collect();
        statuses.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        statuses
    }

    /// Register the functions, bring up the configured channel count per
    /// language and wait until each language has at least one ready
    /// channel. Ready web-host placeholder channels are reused before new
    /// job-host channels are started.
    pub async fn initialize(&self, functions: Vec<FunctionMetadata>) -> Result<(), DispatchError> {
        if functions.is_empty() {
            debug!("dispatcher received no functions; nothing to initialize");
            return Ok(());
        }

        let languages: HashSet<String> =
            functions.iter().map(|f| f.language.clone()).collect();
        let unconfigured: Vec<String> = languages
            .iter()
            .filter(|l| self.factory.worker_config(l).is_none())
            .cloned()
            .collect();
        if !unconfigured.is_empty() {
            return Err(DispatchError::InitializationFailed {
                languages: unconfigured,
            });
        }

        let entered = self.state_tx.send_if_modified(|state| {
            if *state == DispatcherState::Default {
                *state = DispatcherState::Initializing;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(DispatchError::AlreadyInitialized {
                state: self.state().as_ref().to_string(),
            });
        }
        info!(
            functions = functions.len(),
            languages = ?languages,
            "initializing function dispatcher"
        );

        // subscribe before starting channels so no ready event is missed
        let mut events_rx = self.event_bus.subscribe();

        {
            let mut registry = self.functions.write().unwrap();
            for function in &functions {
                debug!(
                    function_id = %function.function_id,
                    function_name = %function.name,
                    language = %function.language,
                    "registering function invocation buffer"
                );
                registry.insert(
                    function.function_id.clone(),
                    Arc::new(FunctionRegistration {
                        metadata: function.clone(),
                        buffer: Mutex::new(VecDeque::new()),
                    }),
                );
            }
            *self.registered_languages.write().unwrap() = languages.clone();
        }

        for language in &languages {
            let desired = self
                .factory
                .worker_config(language)
                .map(|c| c.count_options.process_count)
                .unwrap_or(1);

            // reuse warm placeholder channels held by the web-host manager
            let placeholder_channels = self.webhost_manager.get_ready_channels(language);
            for channel in &placeholder_channels {
                info!(
                    worker_id = %channel.worker_id(),
                    language = %language,
                    "reusing web-host worker channel"
                );
                channel.send_function_load_requests(&functions).await;
            }

            let existing = self.webhost_manager.live_channel_count(language);
            let topup = desired.saturating_sub(existing);
            if topup > 0 {
                let jobhost_manager = self.jobhost_manager.clone();
                let language = language.clone();
                tokio::spawn(async move {
                    if let Err(err) = jobhost_manager.ensure_channels(&language, topup).await {
                        // channel start failures also surface as worker
                        // error events and go through the restart policy
                        warn!(language = %language, error = %err, "worker channel startup failed");
                    }
                });
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.initialization_timeout;
        let mut remaining = languages;
        loop {
            remaining.retain(|language| !self.has_ready_channel(language));
            if remaining.is_empty() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(languages = ?remaining, "dispatcher initialization timed out");
                return Err(DispatchError::InitializationFailed {
                    languages: remaining.into_iter().collect(),
                });
            }
            match tokio::time::timeout(deadline - now, events_rx.recv()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped = skipped, "initialization event subscriber lagged");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return Err(DispatchError::InitializationFailed {
                        languages: remaining.into_iter().collect(),
                    });
                }
            }
        }

        self.transition_state(DispatcherState::Initialized);
        info!("worker processes started and initialized");
        self.flush_notify.notify_one();
        Ok(())
    }

    /// Accept one invocation. Returns immediately once the invocation is
    /// buffered; the returned handle resolves when a worker responds.
    pub async fn invoke(
        &self,
        context: InvocationContext,
    ) -> Result<PendingResult, DispatchError> {
        let state = self.state();
        if !matches!(
            state,
            DispatcherState::Initializing
                | DispatcherState::Initialized
                | DispatcherState::WorkerProcessRestarting
        ) {
            return Err(DispatchError::NotAcceptingInvocations {
                state: state.as_ref().to_string(),
            });
        }

        let registration = self
            .functions
            .read()
            .unwrap()
            .get(&context.function_id)
            .cloned()
            .ok_or_else(|| DispatchError::FunctionNotRegistered {
                function_id: context.function_id.clone(),
            })?;
        let language = registration.metadata.language.clone();
        if self.exhausted_languages.lock().unwrap().contains(&language) {
            return Err(DispatchError::WorkerPoolExhausted { language });
        }

        let invocation_id = context.invocation_id.clone();
        let timeout = self
            .factory
            .worker_config(&language)
            .map(|c| c.function_timeout())
            .unwrap_or_else(|| Duration::from_secs(300));
        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        registration.buffer.lock().unwrap().push_back(BufferedInvocation {
            context,
            result_tx,
            cancel: cancel.clone(),
        });
        trace!(invocation_id = %invocation_id, "invocation buffered");
        self.flush_notify.notify_one();

        Ok(PendingResult {
            invocation_id,
            result_rx,
            timeout,
            cancel,
        })
    }

    /// Stop accepting work, wait for in-flight invocations up to the
    /// grace period, then tear down the owned (job-host) channels.
    /// Idempotent; concurrent calls share one teardown.
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.state() == DispatcherState::Disposed {
            debug!("dispatcher already disposed");
            return;
        }
        info!("shutting down function dispatcher");
        self.transition_state(DispatcherState::Disposing);
        self.cancel.cancel();

        // invocations never handed to a worker cannot complete anymore
        let registrations: Vec<Arc<FunctionRegistration>> =
            self.functions.read().unwrap().values().cloned().collect();
        for registration in registrations {
            let drained: Vec<BufferedInvocation> =
                registration.buffer.lock().unwrap().drain(..).collect();
            for buffered in drained {
                let _ = buffered.result_tx.send(Err(DispatchError::ShuttingDown));
            }
        }

        // web-host channels outlive this dispatcher; wait for their
        // in-flight invocations without closing them
        let webhost_drains = self
            .webhost_manager
            .all_channels()
            .into_iter()
            .map(|channel| {
                let grace = channel.shutdown_grace();
                async move { channel.drain(grace).await }
            });
        futures::future::join_all(webhost_drains).await;

        self.jobhost_manager.shutdown_channels().await;
        self.transition_state(DispatcherState::Disposed);
    }

    fn has_ready_channel(&self, language: &str) -> bool {
        !self.webhost_manager.get_ready_channels(language).is_empty()
            || !self.jobhost_manager.get_ready_channels(language).is_empty()
    }

    fn ready_channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        let mut channels = self.webhost_manager.get_ready_channels(language);
        channels.extend(self.jobhost_manager.get_ready_channels(language));
        channels
    }

    fn find_channel(&self, language: &str, worker_id: &data_model::WorkerId) -> Option<Arc<WorkerChannel>> {
        self.webhost_manager
            .get_channels(language)
            .into_iter()
            .chain(self.jobhost_manager.get_channels(language))
            .find(|c| c.worker_id() == worker_id)
    }

    fn functions_for_language(&self, language: &str) -> Vec<FunctionMetadata> {
        self.functions
            .read()
            .unwrap()
            .values()
            .filter(|r| r.metadata.language == language)
            .map(|r| r.metadata.clone())
            .collect()
    }

    async fn run_flush_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.flush_notify.notified() => {}
                _ = self.cancel.cancelled() => return,
            }
            if self.state() != DispatcherState::Initialized {
                continue;
            }
            self.flush_buffers().await;
        }
    }

    /// Move buffered invocations onto ready channels, FIFO per function.
    async fn flush_buffers(&self) {
        let registrations: Vec<Arc<FunctionRegistration>> =
            self.functions.read().unwrap().values().cloned().collect();
        for registration in registrations {
            let function_id = registration.metadata.function_id.clone();
            let language = registration.metadata.language.clone();
            loop {
                if self.state() != DispatcherState::Initialized {
                    return;
                }
                let buffered = registration.buffer.lock().unwrap().pop_front();
                let Some(buffered) = buffered else {
                    break;
                };
                if buffered.cancel.is_cancelled() {
                    let invocation_id = buffered.context.invocation_id.clone();
                    debug!(invocation_id = %invocation_id, "dropping cancelled invocation from buffer");
                    let _ = buffered
                        .result_tx
                        .send(Err(DispatchError::InvocationCancelled { invocation_id }));
                    continue;
                }
                let ready = self.ready_channels(&language);
                let Some(channel) = self.load_balancer.select(&function_id, &ready) else {
                    // no ready channel; put it back and wait for the next
                    // ready event
                    registration.buffer.lock().unwrap().push_front(buffered);
                    break;
                };
                let channel = channel.clone();
                trace!(
                    invocation_id = %buffered.context.invocation_id,
                    worker_id = %channel.worker_id(),
                    "flushing invocation"
                );
                channel
                    .send_invocation(buffered.context, buffered.result_tx)
                    .await;
            }
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut events_rx: broadcast::Receiver<WorkerEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events_rx.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "dispatcher event loop lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: WorkerEvent) {
        match event {
            WorkerEvent::ChannelReady(ready) => self.on_channel_ready(ready).await,
            WorkerEvent::WorkerError(error_event) => {
                debug!(
                    worker_id = %error_event.worker_id,
                    language = %error_event.language,
                    error = %error_event.error,
                    "handling worker error event"
                );
                self.on_worker_failure(error_event.worker_id, error_event.language, true)
                    .await;
            }
            WorkerEvent::WorkerRestartRequested { worker_id, language } => {
                debug!(
                    worker_id = %worker_id,
                    language = %language,
                    "handling worker restart request"
                );
                self.on_worker_failure(worker_id, language, false).await;
            }
            WorkerEvent::ProcessExited { worker_id, exit_code } => {
                trace!(worker_id = %worker_id, exit_code = ?exit_code, "worker process exited");
            }
            WorkerEvent::PoolExhausted { .. } => {}
        }
    }

    async fn on_channel_ready(&self, ready: ChannelReadyEvent) {
        let functions = self.functions_for_language(&ready.language);
        if !functions.is_empty() {
            if let Some(channel) = self.find_channel(&ready.language, &ready.worker_id) {
                channel.send_function_load_requests(&functions).await;
            }
        }
        let recovered = self.state_tx.send_if_modified(|state| {
            if *state == DispatcherState::WorkerProcessRestarting {
                *state = DispatcherState::Initialized;
                true
            } else {
                false
            }
        });
        if recovered {
            info!(
                language = %ready.language,
                worker_id = %ready.worker_id,
                "worker channel restored; resuming invocation dispatch"
            );
        }
        self.flush_notify.notify_one();
    }

    async fn on_worker_failure(
        self: &Arc<Self>,
        worker_id: data_model::WorkerId,
        language: String,
        counts_towards_budget: bool,
    ) {
        if matches!(
            self.state(),
            DispatcherState::Disposing | DispatcherState::Disposed
        ) {
            return;
        }

        // drop the channel before deciding whether to replace it, so the
        // load balancer can no longer select it
        let removed = match self.webhost_manager.remove_channel(&language, &worker_id) {
            Some(channel) => Some(channel),
            None => self.jobhost_manager.remove_channel(&language, &worker_id),
        };
        match &removed {
            Some(channel) => channel.shutdown(Duration::ZERO).await,
            None => {
                debug!(
                    worker_id = %worker_id,
                    language = %language,
                    "no tracked channel to dispose for worker error"
                );
            }
        }
        self.flush_notify.notify_one();

        if counts_towards_budget {
            self.record_worker_error(&language);
        }
        if removed.is_none() || !self.registered_languages.read().unwrap().contains(&language) {
            return;
        }
        if self.exhausted_languages.lock().unwrap().contains(&language) {
            return;
        }

        let (errors, budget) = self.error_budget(&language);
        if errors <= budget {
            if self.ready_channels(&language).is_empty() {
                let paused = self.state_tx.send_if_modified(|state| {
                    if *state == DispatcherState::Initialized {
                        *state = DispatcherState::WorkerProcessRestarting;
                        true
                    } else {
                        false
                    }
                });
                if paused {
                    info!(
                        language = %language,
                        "no ready worker channels; delaying invocation dispatch until restart completes"
                    );
                }
            }
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.restart_worker_channel(language).await;
            });
        } else {
            self.exhaust_pool(&language);
        }
    }

    /// One restart at a time, spaced by the configured restart interval
    /// plus jitter so a crash-looping worker cannot spin the host.
    async fn restart_worker_channel(self: Arc<Self>, language: String) {
        let _guard = self.restart_lock.lock().await;
        if matches!(
            self.state(),
            DispatcherState::Disposing | DispatcherState::Disposed
        ) {
            return;
        }
        if self.exhausted_languages.lock().unwrap().contains(&language) {
            return;
        }

        let Some(config) = self.factory.worker_config(&language) else {
            return;
        };
        let desired = config
            .count_options
            .process_count
            .saturating_sub(self.webhost_manager.live_channel_count(&language));
        info!(language = %language, "restarting worker channel");
        if let Err(err) = self.jobhost_manager.ensure_channels(&language, desired).await {
            // the failed start has already published a worker error event,
            // which re-enters the restart policy and burns budget
            warn!(language = %language, error = %err, "worker channel restart failed");
        }

        let jitter = rand::rng().random_range(0..MAX_RESTART_JITTER_MS);
        let wait = config.count_options.process_restart_interval()
            + Duration::from_millis(jitter);
        tokio::time::sleep(wait).await;
    }

    fn exhaust_pool(&self, language: &str) {
        {
            let mut exhausted = self.exhausted_languages.lock().unwrap();
            if !exhausted.insert(language.to_string()) {
                return;
            }
        }
        error!(
            language = %language,
            "worker restart budget exhausted; no further workers will be started for this language"
        );
        self.event_bus.publish(WorkerEvent::PoolExhausted {
            language: language.to_string(),
        });

        let registrations: Vec<Arc<FunctionRegistration>> = self
            .functions
            .read()
            .unwrap()
            .values()
            .filter(|r| r.metadata.language == language)
            .cloned()
            .collect();
        for registration in registrations {
            let drained: Vec<BufferedInvocation> =
                registration.buffer.lock().unwrap().drain(..).collect();
            for buffered in drained {
                let _ = buffered.result_tx.send(Err(DispatchError::WorkerPoolExhausted {
                    language: language.to_string(),
                }));
            }
        }
    }

    fn record_worker_error(&self, language: &str) {
        let now = funcrun_utils::get_epoch_time_in_ms();
        let window_ms = self
            .factory
            .worker_config(language)
            .map(|c| c.error_window().as_millis() as u64)
            .unwrap_or(1_800_000);
        let mut buckets = self.error_buckets.lock().unwrap();
        let bucket = buckets.entry(language.to_string()).or_default();
        // a quiet period longer than the window resets the budget
        if let Some(&newest) = bucket.last() {
            if now.saturating_sub(newest) > window_ms {
                debug!(
                    language = %language,
                    discarded = bucket.len(),
                    "restart error window elapsed; resetting error count"
                );
                bucket.clear();
            }
        }
        bucket.push(now);
    }

    fn error_budget(&self, language: &str) -> (usize, usize) {
        let errors = self
            .error_buckets
            .lock()
            .unwrap()
            .get(language)
            .map(|b| b.len())
            .unwrap_or(0);
        let budget = self
            .factory
            .worker_config(language)
            .map(|c| c.restart_threshold())
            .unwrap_or(3);
        (errors, budget)
    }

    fn transition_state(&self, next: DispatcherState) {
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = state.as_ref(), to = next.as_ref(), "dispatcher state transition");
            *state = next;
            true
        });
    }
}
