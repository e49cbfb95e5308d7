pub mod channel;
pub mod channel_manager;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod load_balancer;
pub mod process;
pub mod rpc;
pub mod transport;

#[cfg(test)]
mod integration_test;
#[cfg(test)]
pub(crate) mod testing;

pub use channel::{WorkerChannel, WorkerChannelFactory, WorkerStatus};
pub use channel_manager::{ChannelManagerScope, WorkerChannelManager};
pub use dispatcher::{DispatcherOptions, FunctionDispatcher, PendingResult};
pub use error::DispatchError;
pub use events::{EventBus, WorkerEvent};
pub use process::{OsProcessDriver, ProcessConfig, ProcessDriver, WorkerProcessHandle};
pub use rpc::{RpcServerConfig, RpcTransportServer};
pub use transport::{TransportPair, WorkerTransportFactory};
