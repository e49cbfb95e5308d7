//! Tracks the set of worker channels per language and enforces the
//! configured channel count. Two instances exist with the same contract:
//! a web-host-scoped one that lives for the host process (and carries
//! placeholder channels across specialization), and a job-host-scoped one
//! torn down with its dispatcher.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use data_model::WorkerId;
use tracing::{debug, info, warn};

use crate::{
    channel::{WorkerChannel, WorkerChannelFactory},
    error::DispatchError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelManagerScope {
    WebHost,
    JobHost,
}

impl fmt::Display for ChannelManagerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelManagerScope::WebHost => write!(f, "webhost"),
            ChannelManagerScope::JobHost => write!(f, "jobhost"),
        }
    }
}

pub struct WorkerChannelManager {
    scope: ChannelManagerScope,
    factory: Arc<WorkerChannelFactory>,
    channels: RwLock<HashMap<String, HashMap<WorkerId, Arc<WorkerChannel>>>>,
    // Serializes ensure_channels so concurrent callers (initialization and
    // the restart policy) cannot overshoot the desired count.
    ensure_lock: tokio::sync::Mutex<()>,
}

impl WorkerChannelManager {
    pub fn new(scope: ChannelManagerScope, factory: Arc<WorkerChannelFactory>) -> Arc<Self> {
        Arc::new(Self {
            scope,
            factory,
            channels: RwLock::new(HashMap::new()),
            ensure_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn scope(&self) -> ChannelManagerScope {
        self.scope
    }

    /// Snapshot of all tracked channels for a language, safe to call
    /// concurrently with creation/removal.
    pub fn get_channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        self.channels
            .read()
            .unwrap()
            .get(language)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_ready_channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        self.get_channels(language)
            .into_iter()
            .filter(|c| c.is_ready_for_invocations())
            .collect()
    }

    pub fn all_channels(&self) -> Vec<Arc<WorkerChannel>> {
        self.channels
            .read()
            .unwrap()
            .values()
            .flat_map(|by_id| by_id.values().cloned())
            .collect()
    }

    /// Channels that count towards the desired pool size.
    pub fn live_channel_count(&self, language: &str) -> usize {
        self.get_channels(language)
            .iter()
            .filter(|c| c.state().is_live())
            .count()
    }

    /// Idempotently bring the number of live channels for `language` up to
    /// `desired`, starting new worker processes as needed. Waits until the
    /// new channels are ready or have failed; the first failure is
    /// returned after all starts settle.
    pub async fn ensure_channels(
        &self,
        language: &str,
        desired: usize,
    ) -> Result<(), DispatchError> {
        let _guard = self.ensure_lock.lock().await;

        let missing = desired.saturating_sub(self.live_channel_count(language));
        if missing == 0 {
            return Ok(());
        }
        info!(
            scope = %self.scope,
            language = language,
            missing = missing,
            "starting worker channels"
        );

        let startup_interval = self
            .factory
            .worker_config(language)
            .map(|c| c.count_options.process_startup_interval())
            .unwrap_or_default();

        let mut starts = Vec::with_capacity(missing);
        for index in 0..missing {
            let channel = self.factory.create(language)?;
            {
                let mut channels = self.channels.write().unwrap();
                let by_id = channels.entry(language.to_string()).or_default();
                if by_id.contains_key(channel.worker_id()) {
                    // nanoid collision would be the only way here; refuse
                    // to track two channels under one worker id
                    warn!(worker_id = %channel.worker_id(), "duplicate worker id; skipping channel");
                    continue;
                }
                by_id.insert(channel.worker_id().clone(), channel.clone());
            }
            let factory = self.factory.clone();
            starts.push(tokio::spawn(
                async move { factory.start(&channel).await },
            ));
            if index + 1 < missing {
                tokio::time::sleep(startup_interval).await;
            }
        }

        let mut first_error = None;
        for start in starts {
            match start.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "worker channel start task panicked");
                }
            }
        }
        self.sweep_dead_channels(language);

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Drop a channel from the active set so it is no longer selectable.
    /// Returns the channel when it was tracked here.
    pub fn remove_channel(&self, language: &str, worker_id: &WorkerId) -> Option<Arc<WorkerChannel>> {
        let mut channels = self.channels.write().unwrap();
        let removed = channels.get_mut(language).and_then(|by_id| by_id.remove(worker_id));
        if removed.is_some() {
            debug!(
                scope = %self.scope,
                language = language,
                worker_id = %worker_id,
                "removed worker channel from active set"
            );
        }
        removed
    }

    fn sweep_dead_channels(&self, language: &str) {
        let mut channels = self.channels.write().unwrap();
        if let Some(by_id) = channels.get_mut(language) {
            by_id.retain(|_, channel| !channel.state().is_terminal());
        }
    }

    /// Gracefully close all tracked channels, waiting up to each channel's
    /// configured grace period before its process is force-killed.
    pub async fn shutdown_channels(&self) {
        let all: Vec<Arc<WorkerChannel>> = {
            let mut channels = self.channels.write().unwrap();
            channels
                .drain()
                .flat_map(|(_, by_id)| by_id.into_values())
                .collect()
        };
        if all.is_empty() {
            return;
        }
        info!(scope = %self.scope, count = all.len(), "shutting down worker channels");
        let closes = all.iter().map(|channel| {
            let grace = channel.shutdown_grace();
            async move { channel.shutdown(grace).await }
        });
        futures::future::join_all(closes).await;
    }
}
