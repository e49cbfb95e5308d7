use data_model::{FunctionId, InvocationId, WorkerId};
use thiserror::Error;

/// Error taxonomy of the dispatch path. Launch, handshake and transport
/// errors are handled by the restart policy up to the budget; only
/// `WorkerPoolExhausted` is fatal for a language pool. Business-logic
/// failures are not errors here — they travel inside `InvocationResult`.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("worker process for language '{language}' failed to launch: {message}")]
    WorkerLaunchFailed { language: String, message: String },

    #[error("worker {worker_id} for language '{language}' did not complete its handshake in time")]
    WorkerHandshakeTimeout { worker_id: WorkerId, language: String },

    #[error("worker channel {worker_id} failed: {message}")]
    WorkerChannelError { worker_id: WorkerId, message: String },

    #[error("no ready worker channel for language '{language}'")]
    NoAvailableWorker { language: String },

    #[error("worker pool for language '{language}' is exhausted")]
    WorkerPoolExhausted { language: String },

    #[error("invocation {invocation_id} timed out")]
    InvocationTimeout { invocation_id: InvocationId },

    #[error("invocation {invocation_id} was cancelled")]
    InvocationCancelled { invocation_id: InvocationId },

    #[error("worker {worker_id} failed to load function {function_id}: {message}")]
    FunctionLoadFailed {
        worker_id: WorkerId,
        function_id: FunctionId,
        message: String,
    },

    #[error("function {function_id} is not registered with the dispatcher")]
    FunctionNotRegistered { function_id: FunctionId },

    #[error("dispatcher is already initialized (state '{state}')")]
    AlreadyInitialized { state: String },

    #[error("dispatcher failed to initialize; languages without a ready worker: {languages:?}")]
    InitializationFailed { languages: Vec<String> },

    #[error("dispatcher is not accepting invocations in state '{state}'")]
    NotAcceptingInvocations { state: String },

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}
