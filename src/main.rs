use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;

mod config;
mod service;
mod tracing;

use config::ServerConfig;
use service::Service;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about = "Out-of-process function execution host", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match ServerConfig::from_path(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config: {err:#}");
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    if let Err(err) = setup_tracing(&config) {
        eprintln!("failed to set up tracing: {err:#}");
    }

    let root_span = info_span!(
        "funcrun",
        env = config.env.as_str(),
        instance = config.instance_id()
    );
    let _guard = root_span.enter();

    let service = match Service::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            return;
        }
    };
    if let Err(err) = service.start().await {
        error!("error running function host: {err:#}");
    }
}
