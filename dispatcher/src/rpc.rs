//! Concrete worker transport: a TCP endpoint workers dial into. Frames are
//! newline-delimited JSON with a bounded line length; the first frame on a
//! connection must be `start_stream` carrying the worker id the host
//! assigned at launch. Each connection gets one reader and one writer
//! task, joined only through the channel pair handed to the worker
//! channel.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use data_model::WorkerId;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::{timeout, Duration},
};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::transport::{
    HostMessage, TransportPair, WorkerMessage, WorkerTransportFactory, TRANSPORT_CHANNEL_CAPACITY,
};

pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

/// How long an accepted socket may sit unidentified before it is dropped.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub listen_addr: String,
    pub max_message_length: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

pub struct RpcTransportServer {
    local_addr: SocketAddr,
    max_message_length: usize,
    waiters: DashMap<WorkerId, oneshot::Sender<TransportPair>>,
    parked: DashMap<WorkerId, TransportPair>,
    cancel: CancellationToken,
}

impl RpcTransportServer {
    pub async fn bind(config: RpcServerConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("failed to bind worker endpoint on {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;
        let server = Arc::new(Self {
            local_addr,
            max_message_length: config.max_message_length,
            waiters: DashMap::new(),
            parked: DashMap::new(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(server.clone().run_accept_loop(listener));
        Ok(server)
    }

    /// The address workers are told to dial.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("worker endpoint accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept worker connection");
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let codec = LinesCodec::new_with_max_length(self.max_message_length);
        let framed = Framed::new(stream, codec);
        let (mut sink, mut lines) = framed.split();

        // the first frame identifies the worker
        let first = match timeout(IDENTIFY_TIMEOUT, lines.next()).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(err))) => {
                warn!(peer = %peer, error = %err, "dropping worker connection: bad first frame");
                return;
            }
            Ok(None) => {
                debug!(peer = %peer, "worker connection closed before identifying");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "dropping worker connection: identification timed out");
                return;
            }
        };
        let worker_id = match serde_json::from_str::<WorkerMessage>(&first) {
            Ok(WorkerMessage::StartStream { worker_id }) => worker_id,
            Ok(other) => {
                warn!(peer = %peer, message = ?other, "dropping worker connection: expected start_stream");
                return;
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "dropping worker connection: malformed start_stream");
                return;
            }
        };
        info!(worker_id = %worker_id, peer = %peer, "worker attached");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<HostMessage>(TRANSPORT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<WorkerMessage>(TRANSPORT_CHANNEL_CAPACITY);

        // writer: host messages -> socket
        let writer_worker_id = worker_id.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(worker_id = %writer_worker_id, error = %err, "failed to encode host message");
                        continue;
                    }
                };
                if let Err(err) = sink.send(line).await {
                    debug!(worker_id = %writer_worker_id, error = %err, "worker socket write failed");
                    return;
                }
            }
            // channel closed by the host side; signal EOF to the worker
            let _ = sink.close().await;
        });

        // reader: socket -> worker messages
        let reader_worker_id = worker_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = lines.next().await {
                match frame {
                    Ok(line) => match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(worker_id = %reader_worker_id, error = %err, "malformed worker message; closing stream");
                            return;
                        }
                    },
                    Err(err) => {
                        warn!(worker_id = %reader_worker_id, error = %err, "worker stream error; closing stream");
                        return;
                    }
                }
            }
            debug!(worker_id = %reader_worker_id, "worker stream ended");
        });

        let pair = TransportPair {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        if let Some((_, waiter)) = self.waiters.remove(&worker_id) {
            if waiter.send(pair).is_err() {
                debug!(worker_id = %worker_id, "channel gave up before the worker attached");
            }
        } else {
            self.parked.insert(worker_id, pair);
        }
    }
}

#[async_trait]
impl WorkerTransportFactory for RpcTransportServer {
    async fn connect(&self, worker_id: &WorkerId) -> Result<TransportPair> {
        if let Some((_, pair)) = self.parked.remove(worker_id) {
            return Ok(pair);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(worker_id.clone(), tx);
        // the worker may have attached between the check and the insert
        if let Some((_, pair)) = self.parked.remove(worker_id) {
            self.waiters.remove(worker_id);
            return Ok(pair);
        }
        rx.await
            .map_err(|_| anyhow!("transport server closed before worker {worker_id} attached"))
    }
}
