pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::AsRefStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(nanoid::nanoid!(16))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(String);

impl FunctionId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(nanoid::nanoid!(21))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a binding declared by a function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BindingDirection {
    In,
    Out,
    InOut,
}

/// Trigger/binding descriptor attached to a function. The dispatcher never
/// interprets `raw`; it is carried verbatim to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingInfo {
    pub name: String,
    pub direction: BindingDirection,
    #[serde(default)]
    pub raw: Value,
}

/// Identity of a user function, consumed read-only by the dispatcher to pick
/// a worker pool and to register the function with each channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub function_id: FunctionId,
    pub name: String,
    pub language: String,
    pub entry_point: Option<String>,
    pub script_file: Option<String>,
    #[serde(default)]
    pub bindings: Vec<BindingInfo>,
    #[serde(default = "funcrun_utils::get_epoch_time_in_ms")]
    pub created_at_ms: u64,
}

impl FunctionMetadata {
    pub fn new(name: &str, language: &str) -> Self {
        Self {
            function_id: FunctionId::new(nanoid::nanoid!(16)),
            name: name.to_string(),
            language: language.to_string(),
            entry_point: None,
            script_file: None,
            bindings: Vec::new(),
            created_at_ms: funcrun_utils::get_epoch_time_in_ms(),
        }
    }
}

/// One named, typed input of an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationInput {
    pub name: String,
    pub data_type: Option<String>,
    pub value: Value,
}

/// An invocation handed to the dispatcher by the trigger layer. Immutable
/// once created; owned by the in-flight record until a result is produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationContext {
    pub function_id: FunctionId,
    pub invocation_id: InvocationId,
    pub inputs: Vec<InvocationInput>,
    #[serde(default)]
    pub binding_data: HashMap<String, Value>,
}

impl InvocationContext {
    pub fn new(function_id: FunctionId) -> Self {
        Self {
            function_id,
            invocation_id: InvocationId::generate(),
            inputs: Vec::new(),
            binding_data: HashMap::new(),
        }
    }

    pub fn with_input(mut self, name: &str, value: Value) -> Self {
        self.inputs.push(InvocationInput {
            name: name.to_string(),
            data_type: None,
            value,
        });
        self
    }
}

/// Business-logic failure reported by the worker. Passed through verbatim;
/// never retried by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationFailure {
    pub message: String,
    pub stack_trace: Option<String>,
}

/// Outputs of one completed invocation. Produced exactly once per
/// invocation id.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InvocationResult {
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub return_value: Option<Value>,
    pub failure: Option<InvocationFailure>,
}

impl InvocationResult {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Feature flags declared by a worker during handshake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerCapabilities(HashMap<String, String>);

impl WorkerCapabilities {
    pub fn new(capabilities: HashMap<String, String>) -> Self {
        Self(capabilities)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// State of one worker channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr)]
pub enum ChannelState {
    Starting,
    WaitingForReady,
    Ready,
    Errored,
    Closed,
}

impl ChannelState {
    /// Live channels count towards the desired channel count; terminal ones
    /// do not.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ChannelState::Starting | ChannelState::WaitingForReady | ChannelState::Ready
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Errored | ChannelState::Closed)
    }
}

/// State of the function dispatcher. Invocations are only flushed to
/// channels while `Initialized`; they are still accepted (buffered) during
/// `Initializing` and `WorkerProcessRestarting`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, AsRefStr, Default)]
pub enum DispatcherState {
    #[default]
    Default,
    Initializing,
    Initialized,
    WorkerProcessRestarting,
    Disposing,
    Disposed,
}

fn default_process_count() -> usize {
    1
}

fn default_process_startup_timeout_secs() -> u64 {
    60
}

fn default_worker_init_timeout_secs() -> u64 {
    30
}

fn default_process_startup_interval_ms() -> u64 {
    500
}

fn default_process_restart_interval_ms() -> u64 {
    5_000
}

fn default_process_shutdown_timeout_secs() -> u64 {
    10
}

/// Channel-count and timing knobs for one language's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCountOptions {
    #[serde(default = "default_process_count")]
    pub process_count: usize,
    #[serde(default = "default_process_startup_timeout_secs")]
    pub process_startup_timeout_secs: u64,
    #[serde(default = "default_worker_init_timeout_secs")]
    pub worker_init_timeout_secs: u64,
    #[serde(default = "default_process_startup_interval_ms")]
    pub process_startup_interval_ms: u64,
    #[serde(default = "default_process_restart_interval_ms")]
    pub process_restart_interval_ms: u64,
    #[serde(default = "default_process_shutdown_timeout_secs")]
    pub process_shutdown_timeout_secs: u64,
}

impl Default for WorkerCountOptions {
    fn default() -> Self {
        Self {
            process_count: default_process_count(),
            process_startup_timeout_secs: default_process_startup_timeout_secs(),
            worker_init_timeout_secs: default_worker_init_timeout_secs(),
            process_startup_interval_ms: default_process_startup_interval_ms(),
            process_restart_interval_ms: default_process_restart_interval_ms(),
            process_shutdown_timeout_secs: default_process_shutdown_timeout_secs(),
        }
    }
}

impl WorkerCountOptions {
    pub fn process_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.process_startup_timeout_secs)
    }

    pub fn worker_init_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_init_timeout_secs)
    }

    pub fn process_startup_interval(&self) -> Duration {
        Duration::from_millis(self.process_startup_interval_ms)
    }

    pub fn process_restart_interval(&self) -> Duration {
        Duration::from_millis(self.process_restart_interval_ms)
    }

    pub fn process_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.process_shutdown_timeout_secs)
    }
}

fn default_error_window_secs() -> u64 {
    1_800
}

/// Restart-budget knobs for one language's worker pool. `error_threshold`
/// is the number of automatic restarts permitted inside the sliding window;
/// unset means three per configured channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartOptions {
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
    #[serde(default)]
    pub error_threshold: Option<usize>,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            error_window_secs: default_error_window_secs(),
            error_threshold: None,
        }
    }
}

/// How to launch one language's worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescription {
    pub language: String,
    pub executable_path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub worker_path: Option<String>,
    #[serde(default)]
    pub worker_arguments: Vec<String>,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Complete per-language worker configuration, supplied by the host
/// environment and consumed by the dispatcher as plain values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub description: WorkerDescription,
    #[serde(default)]
    pub count_options: WorkerCountOptions,
    #[serde(default)]
    pub restart: RestartOptions,
    pub function_timeout_secs: Option<u64>,
}

impl WorkerConfig {
    pub fn language(&self) -> &str {
        &self.description.language
    }

    pub fn restart_threshold(&self) -> usize {
        self.restart
            .error_threshold
            .unwrap_or(3 * self.count_options.process_count)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.restart.error_window_secs)
    }

    pub fn function_timeout(&self) -> Duration {
        Duration::from_secs(self.function_timeout_secs.unwrap_or(300))
    }
}
