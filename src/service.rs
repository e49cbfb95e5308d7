use std::sync::Arc;

use anyhow::Result;
use data_model::FunctionMetadata;
use dispatcher::{
    ChannelManagerScope, DispatcherOptions, EventBus, FunctionDispatcher, OsProcessDriver,
    ProcessDriver, RpcServerConfig, RpcTransportServer, WorkerChannelFactory,
    WorkerChannelManager, WorkerEvent, WorkerTransportFactory,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::ServerConfig;

pub struct Service {
    config: ServerConfig,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn start(self) -> Result<()> {
        let config = self.config;
        let event_bus = EventBus::new();

        let rpc = RpcTransportServer::bind(RpcServerConfig {
            listen_addr: config.rpc_listen_addr.clone(),
            max_message_length: config.max_message_length,
        })
        .await?;
        info!(addr = %rpc.local_addr(), "worker RPC endpoint listening");

        let driver: Arc<dyn ProcessDriver> = Arc::new(OsProcessDriver::new());
        let transports: Arc<dyn WorkerTransportFactory> = rpc.clone();
        let factory = Arc::new(WorkerChannelFactory::new(
            driver,
            transports,
            event_bus.clone(),
            config.workers.clone(),
            rpc.local_addr().to_string(),
            config.max_message_length,
        ));
        let webhost_manager = WorkerChannelManager::new(ChannelManagerScope::WebHost, factory.clone());
        let jobhost_manager = WorkerChannelManager::new(ChannelManagerScope::JobHost, factory.clone());

        for language in &config.placeholder_languages {
            if let Err(err) = webhost_manager.ensure_channels(language, 1).await {
                warn!(language = %language, error = %err, "failed to warm placeholder worker channel");
            }
        }

        let dispatcher = FunctionDispatcher::new(
            factory,
            webhost_manager.clone(),
            jobhost_manager,
            DispatcherOptions {
                initialization_timeout: config.initialization_timeout(),
            },
        );
        tokio::spawn(observe_worker_events(dispatcher.subscribe_events()));

        let functions: Vec<FunctionMetadata> =
            config.functions.iter().map(|f| f.to_metadata()).collect();
        dispatcher.initialize(functions).await?;
        let state = dispatcher.state();
        info!(state = state.as_ref(), "function host ready");

        shutdown_signal().await;
        info!("shutdown signal received; draining workers");
        dispatcher.shutdown().await;
        webhost_manager.shutdown_channels().await;
        rpc.shutdown();
        Ok(())
    }
}

/// Host-level bus observer: logs lifecycle events without sitting on the
/// dispatch path.
async fn observe_worker_events(mut events: broadcast::Receiver<WorkerEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::ChannelReady(ready)) => {
                info!(
                    worker_id = %ready.worker_id,
                    language = %ready.language,
                    capabilities = ready.capabilities.len(),
                    "worker channel ready"
                );
            }
            Ok(WorkerEvent::WorkerError(event)) => {
                warn!(
                    worker_id = %event.worker_id,
                    language = %event.language,
                    error = %event.error,
                    "worker error"
                );
            }
            Ok(WorkerEvent::WorkerRestartRequested { worker_id, language }) => {
                info!(worker_id = %worker_id, language = %language, "worker requested restart");
            }
            Ok(WorkerEvent::ProcessExited { .. }) => {}
            Ok(WorkerEvent::PoolExhausted { language }) => {
                error!(language = %language, "worker pool exhausted");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "event observer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
