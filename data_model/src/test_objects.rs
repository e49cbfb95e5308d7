//! Fixture builders shared by tests across the workspace.

use serde_json::json;

use super::{
    FunctionId, FunctionMetadata, InvocationContext, WorkerConfig, WorkerCountOptions,
    WorkerDescription,
};

/// A function with a deterministic id, so tests can refer to it by name.
pub fn test_function(name: &str, language: &str) -> FunctionMetadata {
    let mut metadata = FunctionMetadata::new(name, language);
    metadata.function_id = FunctionId::new(format!("fn-{name}"));
    metadata
}

/// An invocation carrying a single numbered input.
pub fn test_invocation(function: &FunctionMetadata, sequence: u64) -> InvocationContext {
    InvocationContext::new(function.function_id.clone()).with_input("payload", json!(sequence))
}

/// A worker config with timeouts short enough for tests.
pub fn test_worker_config(language: &str) -> WorkerConfig {
    WorkerConfig {
        description: WorkerDescription {
            language: language.to_string(),
            executable_path: format!("/usr/bin/{language}-worker"),
            arguments: Vec::new(),
            worker_path: None,
            worker_arguments: Vec::new(),
            working_directory: None,
            env: Default::default(),
        },
        count_options: WorkerCountOptions {
            process_count: 1,
            process_startup_timeout_secs: 2,
            worker_init_timeout_secs: 2,
            process_startup_interval_ms: 10,
            process_restart_interval_ms: 50,
            process_shutdown_timeout_secs: 1,
        },
        restart: Default::default(),
        function_timeout_secs: Some(5),
    }
}
