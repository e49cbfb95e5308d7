use std::{collections::HashSet, net::SocketAddr, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use data_model::{FunctionId, FunctionMetadata, WorkerConfig};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    // port 0: workers are handed the resolved address on their command line
    "127.0.0.1:0".to_string()
}

fn default_max_message_length() -> usize {
    dispatcher::rpc::DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_initialization_timeout_secs() -> u64 {
    90
}

fn generate_instance_id() -> String {
    nanoid::nanoid!(10)
}

/// One user function declared to the host. Binding payloads stay opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub language: String,
    pub entry_point: Option<String>,
    pub script_file: Option<String>,
}

impl FunctionSpec {
    pub fn to_metadata(&self) -> FunctionMetadata {
        let mut metadata = FunctionMetadata::new(&self.name, &self.language);
        metadata.function_id = FunctionId::new(format!("{}-{}", self.language, self.name));
        metadata.entry_point = self.entry_point.clone();
        metadata.script_file = self.script_file.clone();
        metadata
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub rpc_listen_addr: String,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "generate_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_initialization_timeout_secs")]
    pub initialization_timeout_secs: u64,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
    /// Languages to keep a warm placeholder worker for, started before any
    /// functions are known.
    #[serde(default)]
    pub placeholder_languages: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_listen_addr: default_listen_addr(),
            max_message_length: default_max_message_length(),
            structured_logging: false,
            env: default_env(),
            instance_id: generate_instance_id(),
            initialization_timeout_secs: default_initialization_timeout_secs(),
            workers: Vec::new(),
            functions: Vec::new(),
            placeholder_languages: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &Path) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn initialization_timeout(&self) -> Duration {
        Duration::from_secs(self.initialization_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid rpc listen address: {}", self.rpc_listen_addr));
        }

        let mut languages = HashSet::new();
        for worker in &self.workers {
            if worker.description.executable_path.is_empty() {
                return Err(anyhow!(
                    "worker config for language '{}' has an empty executable path",
                    worker.language()
                ));
            }
            if worker.count_options.process_count == 0 {
                return Err(anyhow!(
                    "worker config for language '{}' has a zero process count",
                    worker.language()
                ));
            }
            if !languages.insert(worker.language().to_string()) {
                return Err(anyhow!(
                    "duplicate worker config for language '{}'",
                    worker.language()
                ));
            }
        }

        for function in &self.functions {
            if !languages.contains(&function.language) {
                return Err(anyhow!(
                    "function '{}' uses language '{}' but no worker config declares it",
                    function.name,
                    function.language
                ));
            }
        }
        for language in &self.placeholder_languages {
            if !languages.contains(language) {
                return Err(anyhow!(
                    "placeholder language '{}' has no worker config",
                    language
                ));
            }
        }
        Ok(())
    }
}
