//! The boundary between the dispatcher and the RPC layer. The dispatcher
//! sees each worker as one ordered duplex stream of tagged messages; how
//! those messages are framed on the wire is the transport's business.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{
    FunctionId, FunctionMetadata, InvocationContext, InvocationFailure, InvocationId,
    InvocationInput, WorkerCapabilities, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub const TRANSPORT_CHANNEL_CAPACITY: usize = 128;

/// Invocation payload sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: InvocationId,
    pub function_id: FunctionId,
    pub inputs: Vec<InvocationInput>,
    #[serde(default)]
    pub binding_data: HashMap<String, Value>,
}

impl From<InvocationContext> for InvocationRequest {
    fn from(context: InvocationContext) -> Self {
        Self {
            invocation_id: context.invocation_id,
            function_id: context.function_id,
            inputs: context.inputs,
            binding_data: context.binding_data,
        }
    }
}

/// Messages the host sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    InitWorker {
        host_version: String,
        max_message_length: usize,
    },
    LoadFunction {
        function: FunctionMetadata,
    },
    Invoke {
        invocation: InvocationRequest,
    },
    /// Close notice sent during graceful shutdown.
    CloseStream,
}

/// Response to one invocation, keyed by invocation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub invocation_id: InvocationId,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub return_value: Option<Value>,
    pub failure: Option<InvocationFailure>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
}

/// Messages a worker sends to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message on a connection; identifies the worker. Consumed by
    /// the transport layer, never seen by the channel.
    StartStream { worker_id: WorkerId },
    /// Handshake completion: the worker is ready to load functions and
    /// accept invocations.
    WorkerReady {
        worker_version: String,
        #[serde(default)]
        capabilities: WorkerCapabilities,
    },
    /// Acknowledgement (or failure) of one function-load request.
    FunctionLoaded {
        function_id: FunctionId,
        error: Option<String>,
    },
    InvocationResponse(InvocationResponse),
    /// Worker-side log line, re-logged host-side at its level.
    Log {
        level: WorkerLogLevel,
        message: String,
        invocation_id: Option<InvocationId>,
    },
}

/// The two halves of one worker's duplex stream. Send order is preserved
/// per worker; the pair is owned by exactly one channel.
pub struct TransportPair {
    pub outbound: mpsc::Sender<HostMessage>,
    pub inbound: mpsc::Receiver<WorkerMessage>,
}

/// Hands a channel its transport once the identified worker attaches.
#[async_trait]
pub trait WorkerTransportFactory: Send + Sync {
    async fn connect(&self, worker_id: &WorkerId) -> Result<TransportPair>;
}
