use anyhow::Result;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::config::ServerConfig;

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG controls the logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn setup_tracing(config: &ServerConfig) -> Result<()> {
    let env_filter = get_env_filter();
    let registry = tracing_subscriber::Registry::default();

    let result = if config.structured_logging {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_filter(env_filter);
        tracing::subscriber::set_global_default(registry.with(layer))
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_filter(env_filter);
        tracing::subscriber::set_global_default(registry.with(layer))
    };
    if let Err(err) = result {
        error!("logger was already initiated, continuing: {:?}", err);
    }
    Ok(())
}
