use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use common::wire::TunnelFrame;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use crate::error::CommandError;

/// Per-node cap on concurrently correlated commands.
pub const MAX_INFLIGHT_COMMANDS: usize = 16;

/// Buffer depth for chunk events on a binary stream.
const STREAM_EVENT_BUFFER: usize = 16;

/// Registry of active agent tunnels, one session per node.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<RwLock<HashMap<Uuid, TunnelSession>>>,
    failures: Arc<RwLock<HashMap<Uuid, TunnelFailure>>>,
}

#[derive(Clone)]
pub struct TunnelSession {
    pub tunnel_id: Uuid,
    pub last_heartbeat: Instant,
    pub command_tx: mpsc::Sender<AgentCommand>,
    pub inflight: Arc<Semaphore>,
}

#[derive(Clone, Debug)]
struct TunnelFailure {
    pub reason: String,
    pub at: Instant,
}

/// Work items handed to a tunnel's connection driver.
#[derive(Debug)]
pub enum AgentCommand {
    /// Fire-and-forget frame, no correlation.
    Send { frame: TunnelFrame },
    /// Correlated command expecting a single reply frame.
    Request {
        request_id: String,
        frame: TunnelFrame,
        started_at: Instant,
        response_tx: oneshot::Sender<Result<serde_json::Value, CommandError>>,
    },
    /// Correlated command expecting a sequence of binary chunks.
    Stream {
        request_id: String,
        frame: TunnelFrame,
        started_at: Instant,
        events_tx: mpsc::Sender<StreamEvent>,
    },
    /// Drop the pending entry for an abandoned request.
    Cancel { request_id: String },
}

#[derive(Debug)]
pub enum StreamEvent {
    Chunk(Bytes),
    End,
    Error(String),
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn upsert(
        &self,
        node_id: Uuid,
        tunnel_id: Uuid,
        command_tx: mpsc::Sender<AgentCommand>,
        inflight: Arc<Semaphore>,
    ) {
        let mut guard = self.inner.write().await;
        guard.insert(
            node_id,
            TunnelSession {
                tunnel_id,
                last_heartbeat: Instant::now(),
                command_tx,
                inflight,
            },
        );
        // Clear any previous failure record now that the node is connected again.
        let mut failures = self.failures.write().await;
        failures.remove(&node_id);
        gauge!("aero_cp_tunnel_sessions").set(guard.len() as f64);
    }

    pub async fn touch_heartbeat(&self, node_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.get_mut(&node_id) {
            session.last_heartbeat = Instant::now();
        }
    }

    /// Removes a session, but only if it still belongs to the given tunnel.
    /// A reconnect replaces the session; the old driver must not evict it.
    pub async fn remove(&self, node_id: Uuid, tunnel_id: Uuid, reason: &str) {
        let mut guard = self.inner.write().await;
        let owned = guard
            .get(&node_id)
            .map(|s| s.tunnel_id == tunnel_id)
            .unwrap_or(false);
        if owned {
            guard.remove(&node_id);
            counter!(
                "aero_cp_tunnel_disconnect_total",
                "reason" => reason.to_string()
            )
            .increment(1);
            gauge!("aero_cp_tunnel_sessions").set(guard.len() as f64);
            let mut failures = self.failures.write().await;
            failures.insert(
                node_id,
                TunnelFailure {
                    reason: reason.to_string(),
                    at: Instant::now(),
                },
            );
        }
    }

    pub async fn contains(&self, node_id: Uuid) -> bool {
        let guard = self.inner.read().await;
        guard.contains_key(&node_id)
    }

    pub async fn snapshot(&self) -> TunnelRegistrySnapshot {
        let guard = self.inner.read().await;
        let total = guard.len();
        let now = Instant::now();
        let newest = guard
            .values()
            .map(|s| now.saturating_duration_since(s.last_heartbeat))
            .min();
        let failures = self.failures.read().await;
        let mut statuses: Vec<NodeTunnelStatus> = guard
            .iter()
            .map(|(node_id, session)| NodeTunnelStatus {
                node_id: *node_id,
                status: TunnelStatus::Connected,
                last_heartbeat_secs: Some(
                    now.saturating_duration_since(session.last_heartbeat)
                        .as_secs(),
                ),
                last_error: None,
                last_event_secs: None,
            })
            .collect();
        statuses.extend(failures.iter().map(|(node_id, failure)| NodeTunnelStatus {
            node_id: *node_id,
            status: TunnelStatus::Disconnected,
            last_heartbeat_secs: None,
            last_error: Some(failure.reason.clone()),
            last_event_secs: Some(now.saturating_duration_since(failure.at).as_secs()),
        }));
        TunnelRegistrySnapshot {
            total,
            freshest_heartbeat_age: newest,
            statuses,
        }
    }

    async fn acquire(
        &self,
        node_id: Uuid,
    ) -> Result<(mpsc::Sender<AgentCommand>, OwnedSemaphorePermit), CommandError> {
        let guard = self.inner.read().await;
        let Some(session) = guard.get(&node_id) else {
            return Err(CommandError::NoTunnel);
        };

        let permit = session
            .inflight
            .clone()
            .try_acquire_owned()
            .map_err(|_| CommandError::Overloaded)?;

        Ok((session.command_tx.clone(), permit))
    }

    /// Fire-and-forget delivery. The frame is dropped if the driver's queue
    /// is full rather than blocking the caller.
    pub async fn send(&self, node_id: Uuid, frame: TunnelFrame) -> Result<(), CommandError> {
        let guard = self.inner.read().await;
        let Some(session) = guard.get(&node_id) else {
            return Err(CommandError::NoTunnel);
        };
        session
            .command_tx
            .try_send(AgentCommand::Send { frame })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => CommandError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => CommandError::ChannelClosed,
            })
    }

    /// Fire-and-forget delivery that waits for queue capacity instead of
    /// dropping. Used for ordered chunk pushes inside a correlated exchange.
    pub async fn push(&self, node_id: Uuid, frame: TunnelFrame) -> Result<(), CommandError> {
        let command_tx = {
            let guard = self.inner.read().await;
            let Some(session) = guard.get(&node_id) else {
                return Err(CommandError::NoTunnel);
            };
            session.command_tx.clone()
        };
        command_tx
            .send(AgentCommand::Send { frame })
            .await
            .map_err(|_| CommandError::ChannelClosed)
    }

    /// Sends a correlated command and waits for its reply frame.
    pub async fn request(
        &self,
        node_id: Uuid,
        frame: TunnelFrame,
        timeout: Duration,
    ) -> Result<serde_json::Value, CommandError> {
        let request_id = format!("r-{}", Uuid::new_v4());
        self.request_with_id(node_id, frame, request_id, timeout)
            .await
    }

    /// Like [`request`](Self::request) but with a caller-supplied request id,
    /// so multi-frame exchanges can correlate under one id.
    pub async fn request_with_id(
        &self,
        node_id: Uuid,
        mut frame: TunnelFrame,
        request_id: String,
        timeout: Duration,
    ) -> Result<serde_json::Value, CommandError> {
        // Keep the permit alive until the reply arrives to enforce the
        // per-node inflight limit.
        let (command_tx, _permit) = self.acquire(node_id).await?;

        frame.set_request_id(request_id.clone());
        let (response_tx, response_rx) = oneshot::channel();

        counter!("aero_cp_tunnel_commands_total", "kind" => "request").increment(1);
        command_tx
            .send(AgentCommand::Request {
                request_id: request_id.clone(),
                frame,
                started_at: Instant::now(),
                response_tx,
            })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => Err(CommandError::ChannelClosed),
            Err(_elapsed) => {
                // Prune the pending entry so a late reply is discarded.
                let _ = command_tx.try_send(AgentCommand::Cancel {
                    request_id: request_id.clone(),
                });
                Err(CommandError::Timeout)
            }
        }
    }

    /// Starts a binary download from the agent and returns a pull handle over
    /// its chunks. The handle owns an inflight permit and cancels the stream
    /// on drop.
    pub async fn stream_binary(
        &self,
        node_id: Uuid,
        mut frame: TunnelFrame,
        timeout: Duration,
    ) -> Result<BinaryStream, CommandError> {
        let (command_tx, permit) = self.acquire(node_id).await?;

        let request_id = format!("s-{}", Uuid::new_v4());
        frame.set_request_id(request_id.clone());
        let (events_tx, events_rx) = mpsc::channel(STREAM_EVENT_BUFFER);

        counter!("aero_cp_tunnel_commands_total", "kind" => "stream").increment(1);
        command_tx
            .send(AgentCommand::Stream {
                request_id: request_id.clone(),
                frame,
                started_at: Instant::now(),
                events_tx,
            })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;

        Ok(BinaryStream {
            events_rx,
            command_tx,
            request_id,
            deadline: tokio::time::Instant::now() + timeout,
            finished: false,
            _permit: permit,
        })
    }
}

/// Pull side of an agent-to-plane binary stream.
pub struct BinaryStream {
    events_rx: mpsc::Receiver<StreamEvent>,
    command_tx: mpsc::Sender<AgentCommand>,
    request_id: String,
    deadline: tokio::time::Instant,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl BinaryStream {
    /// Next decoded chunk, `Ok(None)` on clean end of stream. The stream's
    /// overall deadline applies across all chunks.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CommandError> {
        if self.finished {
            return Ok(None);
        }
        match tokio::time::timeout_at(self.deadline, self.events_rx.recv()).await {
            Ok(Some(StreamEvent::Chunk(chunk))) => Ok(Some(chunk)),
            Ok(Some(StreamEvent::End)) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Some(StreamEvent::Error(message))) => {
                self.finished = true;
                Err(CommandError::Remote(message))
            }
            Ok(None) => {
                self.finished = true;
                Err(CommandError::Disconnected)
            }
            Err(_elapsed) => {
                self.finished = true;
                Err(CommandError::Timeout)
            }
        }
    }
}

impl Drop for BinaryStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.command_tx.try_send(AgentCommand::Cancel {
                request_id: self.request_id.clone(),
            });
        }
    }
}

#[derive(Clone, Debug)]
pub struct TunnelRegistrySnapshot {
    pub total: usize,
    pub freshest_heartbeat_age: Option<Duration>,
    pub statuses: Vec<NodeTunnelStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct NodeTunnelStatus {
    pub node_id: Uuid,
    pub status: TunnelStatus,
    pub last_heartbeat_secs: Option<u64>,
    pub last_error: Option<String>,
    pub last_event_secs: Option<u64>,
}
